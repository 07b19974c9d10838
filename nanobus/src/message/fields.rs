use crate::message::FieldCode;
use crate::variant::Variant;

/// The header fields of a message.
///
/// Keys are unique; iteration follows insertion order so the encoded layout
/// is caller-stable.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct Fields(Vec<(FieldCode, Variant)>);

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `value` under `code`, replacing any previous entry.
    pub fn replace(&mut self, code: FieldCode, value: Variant) {
        match self.0.iter_mut().find(|(c, _)| *c == code) {
            Some(entry) => entry.1 = value,
            None => self.0.push((code, value)),
        }
    }

    pub fn get(&self, code: FieldCode) -> Option<&Variant> {
        self.0
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(FieldCode, Variant)> {
        self.0.iter()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }
}

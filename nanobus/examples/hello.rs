use std::time::Duration;

use nanobus::{Connection, Message, Result};

fn main() -> Result<()> {
    let mut bus = Connection::system()?;
    println!(
        "connected as {}",
        bus.unique_name().unwrap_or("<no unique name>")
    );

    let mut msg = Message::new();
    let serial = msg.prepare_call(
        "org.freedesktop.DBus",
        "/org/freedesktop/DBus",
        "org.freedesktop.DBus",
        "GetNameOwner",
    )?;
    msg.add_argument(&"org.freedesktop.DBus")?;
    bus.send(msg)?;

    let mut reply = bus.wait_reply(serial, Duration::from_millis(2000))?;
    let owner: String = reply.extract_argument()?;
    println!("org.freedesktop.DBus is owned by {owner}");

    Ok(())
}

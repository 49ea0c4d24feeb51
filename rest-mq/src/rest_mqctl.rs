//! Command-line harness for the message bus.
//!
//! Two forms: `rest-mqctl <recipient> <verb> <resource> <value>...` sends
//! one message, `rest-mqctl <selfPath>` receives one and prints it as a
//! JSON event line (`--follow` keeps receiving until interrupted).

use std::env;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use signal_hook::flag;

use rest_mq::bus::{Bus, BusConfig};
use rest_mq::message::{Message, Verb, FIELD_VALUE_MAX};
use rest_mq::registry::{ResourceType, NO_MORE_RESOURCES};

/// Path this harness sends from.
const SENDER_PATH: &str = "/util";

/// How long to sleep between empty polls in `--follow` mode.
const POLL_PAUSE: Duration = Duration::from_millis(50);

fn main() {
    if let Err(err) = real_main() {
        let _ = writeln!(io::stderr(), "rest-mqctl: {err:#}");
        process::exit(1);
    }
}

fn real_main() -> Result<()> {
    env_logger::init();
    let options = parse_args(env::args().skip(1))?;

    let mut config = BusConfig::default();
    if let Some(path) = &options.config_path {
        config.config_path = path.clone();
    }
    let mut bus = Bus::open(config);

    match options.positional.len() {
        1 => receive_loop(&mut bus, &options.positional[0], options.follow),
        n if n >= 4 && (n - 2) % 2 == 0 => send_message(&mut bus, &options.positional),
        _ => {
            print_usage();
            bail!("unexpected arguments");
        }
    }
}

/// Resolved CLI options: flags plus the positional form.
struct Options {
    config_path: Option<PathBuf>,
    follow: bool,
    positional: Vec<String>,
}

fn parse_args(argv: impl Iterator<Item = String>) -> Result<Options> {
    let mut argv = argv;
    let mut config_path = env::var("REST_MQ_CONFIG").ok().map(PathBuf::from);
    let mut follow = false;
    let mut positional = Vec::new();

    while let Some(arg) = argv.next() {
        match arg.as_str() {
            "--config" => {
                config_path = Some(PathBuf::from(
                    argv.next().context("--config requires a path")?,
                ));
            }
            "--follow" => follow = true,
            "--help" => {
                print_usage();
                process::exit(0);
            }
            other if other.starts_with("--") => bail!("unknown option {other}"),
            _ => positional.push(arg),
        }
    }

    Ok(Options {
        config_path,
        follow,
        positional,
    })
}

fn print_usage() {
    eprintln!(
        "Usage: rest-mqctl [--config PATH] <recipientPath> <verb> <resource> <value> [<resource> <value>...]\n\
         \x20      rest-mqctl [--config PATH] [--follow] <selfPath>"
    );
}

fn parse_verb(token: &str) -> Verb {
    match token {
        "create" => Verb::Create,
        "delete" => Verb::Delete,
        "get" => Verb::Get,
        "set" => Verb::Set,
        _ => Verb::Ack,
    }
}

/// The send form: build one message from the resource/value pairs and queue
/// it for the recipient.
fn send_message(bus: &mut Bus, positional: &[String]) -> Result<()> {
    let recipient_path = &positional[0];
    let verb = parse_verb(&positional[1]);

    let mut message = Message::with_verb(verb);
    let sender = bus
        .create_agent(SENDER_PATH)
        .context("cannot create the sender agent")?;
    message.set_sender(sender);
    let recipient = bus
        .create_agent(recipient_path)
        .with_context(|| format!("cannot create agent {recipient_path}"))?;
    message.set_recipient(recipient);

    for pair in positional[2..].chunks(2) {
        let key = bus.create_resource(&pair[0]);
        message.append(bus, key, pair[1].as_bytes());
    }
    if !message.is_valid() {
        bail!("message overflowed the recipient's body limit");
    }

    bus.send(&message)
        .with_context(|| format!("cannot send to {recipient_path}"))?;
    Ok(())
}

/// The receive form: print one message, or keep printing until interrupted
/// when following.
fn receive_loop(bus: &mut Bus, path: &str, follow: bool) -> Result<()> {
    let key = bus
        .create_agent(path)
        .with_context(|| format!("cannot create agent {path}"))?;

    let stop = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        flag::register(signal, Arc::clone(&stop))?;
    }

    while !stop.load(Ordering::Relaxed) {
        match bus.receive(key) {
            Some(message) => {
                print_event(bus, &message)?;
                if !follow {
                    break;
                }
            }
            None => thread::sleep(POLL_PAUSE),
        }
    }
    Ok(())
}

/// One received message as a JSON event line.
#[derive(Serialize)]
struct ReceivedEvent<'a> {
    ts: DateTime<Utc>,
    sender: &'a str,
    recipient: &'a str,
    verb: String,
    fields: Vec<serde_json::Value>,
}

fn print_event(bus: &Bus, message: &Message) -> Result<()> {
    let mut fields = Vec::new();
    let mut offset = 0;
    loop {
        let key = message.resource_key(offset);
        if key == NO_MORE_RESOURCES {
            break;
        }
        if message.is_bang(offset) {
            fields.push(json!({ "bang": true }));
        } else {
            fields.push(json!({
                "resource": bus.resource_name(key).unwrap_or("?"),
                "key": key,
                "value": render_value(bus, message, offset, key),
            }));
        }
        offset = message.next_field_offset(offset);
    }

    let event = ReceivedEvent {
        ts: Utc::now(),
        sender: bus.path_of(message.sender()).unwrap_or("?"),
        recipient: bus.path_of(message.recipient()).unwrap_or("?"),
        verb: message.verb().to_string(),
        fields,
    };
    println!("{}", serde_json::to_string(&event)?);
    Ok(())
}

fn render_value(
    bus: &Bus,
    message: &Message,
    offset: usize,
    key: rest_mq::ResourceKey,
) -> serde_json::Value {
    match bus.resource_type(key) {
        ResourceType::OctetStr
        | ResourceType::Opaque
        | ResourceType::IpAddress
        | ResourceType::UnknownType => {
            let mut value = [0u8; FIELD_VALUE_MAX + 1];
            let n = message.extract_string(bus, &mut value, offset);
            json!(String::from_utf8_lossy(&value[..n]))
        }
        _ => json!(message.extract_integer(bus, offset)),
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_args, parse_verb};
    use rest_mq::message::Verb;

    #[test]
    fn verb_tokens_map_to_verbs() {
        assert_eq!(parse_verb("create"), Verb::Create);
        assert_eq!(parse_verb("delete"), Verb::Delete);
        assert_eq!(parse_verb("get"), Verb::Get);
        assert_eq!(parse_verb("set"), Verb::Set);
        assert_eq!(parse_verb("poke"), Verb::Ack);
    }

    #[test]
    fn options_and_positionals_separate() {
        let options = parse_args(
            ["--config", "/tmp/names.conf", "--follow", "/b"]
                .into_iter()
                .map(String::from),
        )
        .unwrap();
        assert!(options.follow);
        assert_eq!(
            options.config_path.as_deref(),
            Some(std::path::Path::new("/tmp/names.conf"))
        );
        assert_eq!(options.positional, vec!["/b".to_string()]);
    }

    #[test]
    fn unknown_options_are_rejected() {
        assert!(parse_args(["--frobnicate"].into_iter().map(String::from)).is_err());
    }
}

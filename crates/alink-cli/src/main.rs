//! # Alink CLI
//!
//! Command-line utilities for signing credentials and inspecting topics.

use alink_core::sign::now_ms;
use alink_core::{sign, DeviceIdentity, MqttCredentials, SignMethod};
use alink_proto::{Prefix, TopicLayout};
use anyhow::{bail, Context, Result};
use std::env;

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    match args[1].as_str() {
        "sign" => {
            if args.len() < 5 {
                eprintln!("Usage: alink sign <method> <secret> <content>");
                std::process::exit(1);
            }
            let method: SignMethod = args[2].parse().context("Invalid sign method")?;
            println!("{}", sign(method, &args[3], &args[4]));
        }
        "credentials" => {
            if args.len() < 5 {
                eprintln!("Usage: alink credentials <productKey> <deviceName> <deviceSecret> [method] [timestamp]");
                std::process::exit(1);
            }
            let identity = DeviceIdentity::new(&args[2], &args[3], &args[4]);
            let method = match args.get(5) {
                Some(method) => method.parse().context("Invalid sign method")?,
                None => SignMethod::default(),
            };
            let timestamp = match args.get(6) {
                Some(ts) => ts.parse().context("Invalid timestamp")?,
                None => now_ms(),
            };
            let credentials = MqttCredentials::for_device(&identity, method, timestamp, 3);
            println!("client_id: {}", credentials.client_id);
            println!("username:  {}", credentials.username);
            println!("password:  {}", credentials.password);
        }
        "topic" => topic_command(&args[2..])?,
        "help" | "--help" | "-h" => {
            print_help();
        }
        cmd => {
            eprintln!("Unknown command: {cmd}");
            print_help();
            std::process::exit(1);
        }
    }

    Ok(())
}

fn topic_command(args: &[String]) -> Result<()> {
    let (layout, args) = match args {
        [flag, root, rest @ ..] if flag == "--root" => (TopicLayout::with_root(root.as_str()), rest),
        rest => (TopicLayout::mqtt(), rest),
    };

    match args {
        [cmd, prefix, pk, dn, path] if cmd == "build" => {
            let prefix = parse_prefix(prefix)?;
            println!("{}", layout.build(prefix, path, pk, dn, None));
        }
        [cmd, topic] if cmd == "split" => {
            for (index, segment) in TopicLayout::split(topic).iter().enumerate() {
                println!("{index}: {segment}");
            }
        }
        [cmd, topic] if cmd == "parse" => {
            let parts = layout.parse(topic)?;
            println!("prefix:    {:?}", parts.prefix);
            println!("device:    {}", parts.device);
            println!("operation: {}", parts.operation);
            println!("reply:     {}", parts.reply);
        }
        _ => {
            eprintln!("Usage: alink topic [--root <segment>] build <prefix> <productKey> <deviceName> <path>");
            eprintln!("       alink topic [--root <segment>] parse <topic>");
            eprintln!("       alink topic split <topic>");
            std::process::exit(1);
        }
    }
    Ok(())
}

fn parse_prefix(value: &str) -> Result<Prefix> {
    Ok(match value {
        "sys" => Prefix::Sys,
        "ext/session" | "session" => Prefix::ExtSession,
        "ext/ntp" | "ntp" => Prefix::ExtNtp,
        "ext/error" | "error" => Prefix::ExtError,
        other => bail!("Unknown topic prefix '{other}'"),
    })
}

fn print_help() {
    println!(
        r#"Alink CLI

USAGE:
    alink <COMMAND> [OPTIONS]

COMMANDS:
    sign <method> <secret> <content>        HMAC-sign content (hex digest)
    credentials <pk> <dn> <secret> [method] [timestamp]
                                            Derive MQTT CONNECT credentials
    topic [--root <seg>] build <prefix> <pk> <dn> <path>
                                            Build a topic
    topic [--root <seg>] parse <topic>      Parse an inbound topic
    topic split <topic>                     Show a topic's segments
    help                                    Show this help message

EXAMPLES:
    alink sign hmacsha256 secret "clientIdpk.dndeviceNamednproductKeypktimestamp1"
    alink topic --root topic build sys a1B2 gw-01 thing/event/property/post
    alink topic parse /ext/session/a1B2/gw-01/combine/login_reply
"#
    );
}

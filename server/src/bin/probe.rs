//! Diagnostic client: asks a DBSS about one object through the router and
//! prints the answer.

use clap::Parser;
use dbss::config::AppConfig;
use dbss_shared::messages::{add_channel, remove_channel, QueryAllReply};
use dbss_shared::msgtypes::{DBSS_OBJECT_GET_ACTIVATED_RESP, STATESERVER_OBJECT_GET_ALL_RESP};
use dbss_shared::{Channel, ClassRegistry, DatagramIterator, DoId, ObjectRequest};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

type ProbeError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Query a DBSS object through the router")]
struct Args {
    /// Router address
    #[clap(short, long, default_value = "127.0.0.1:7199")]
    router: SocketAddr,
    /// Channel this probe listens on
    #[clap(short, long, default_value = "5")]
    channel: Channel,
    /// Object to ask about
    #[clap(short, long)]
    object: DoId,
    /// Only ask whether the object is active; never loads it
    #[clap(short, long)]
    activated: bool,
    /// DBSS config file, used to name the required fields of the reply
    #[clap(long)]
    config: Option<PathBuf>,
    /// How long to wait for the answer
    #[clap(long, default_value = "3000")]
    timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), ProbeError> {
    let args = Args::parse();

    let classes = match &args.config {
        Some(path) => Some(AppConfig::load_from_file(path).await?.validate()?.classes),
        None => None,
    };

    // Create local socket
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    println!("Probe socket bound to {}", socket.local_addr()?);

    socket
        .send_to(add_channel(args.channel)?.as_bytes(), args.router)
        .await?;

    let token = rand::random::<u32>();
    let request = if args.activated {
        ObjectRequest::GetActivated {
            do_id: args.object,
            requester: args.channel,
            token,
        }
    } else {
        ObjectRequest::QueryAll {
            do_id: args.object,
            requester: args.channel,
            token,
        }
    };
    println!("Sending {} for object {} (token {})", request.name(), args.object, token);
    socket.send_to(request.encode()?.as_bytes(), args.router).await?;

    let mut buf = vec![0u8; dbss_shared::datagram::MAX_DATAGRAM_SIZE];
    let wait = Duration::from_millis(args.timeout_ms);
    let result = loop {
        let len = match timeout(wait, socket.recv_from(&mut buf)).await {
            Ok(received) => received?.0,
            Err(_) => break Err(format!("no answer within {}ms", args.timeout_ms)),
        };
        match print_reply(&buf[..len], token, classes.as_deref()) {
            Ok(true) => break Ok(()),
            Ok(false) => continue,
            Err(e) => println!("Failed to decode reply: {}", e),
        }
    };

    socket
        .send_to(remove_channel(args.channel)?.as_bytes(), args.router)
        .await?;

    match result {
        Ok(()) => Ok(()),
        Err(reason) => {
            println!("{}", reason);
            Err(reason.into())
        }
    }
}

/// Prints the reply if it answers `token`; returns whether it did.
fn print_reply(
    data: &[u8],
    token: u32,
    classes: Option<&ClassRegistry>,
) -> Result<bool, ProbeError> {
    let mut dgi = DatagramIterator::new(data);
    let header = dgi.read_header()?;

    match header.msg_type {
        STATESERVER_OBJECT_GET_ALL_RESP => {
            let reply = QueryAllReply::read(&mut dgi)?;
            if reply.token != token {
                return Ok(false);
            }

            println!("Object {} is class {}", header.sender, reply.class_id);
            match reply.location {
                Some(location) => println!("  location: {}", location),
                None => println!("  location: none"),
            }

            match classes.and_then(|c| c.get(reply.class_id)) {
                Some(class) => {
                    for field in class.required_fields() {
                        let value = field.kind.read_value(&mut dgi)?;
                        println!("  {} = {:?}", field.name, value.as_bytes());
                    }
                }
                None => println!("  {} bytes of required fields", dgi.remaining()),
            }
            Ok(true)
        }
        DBSS_OBJECT_GET_ACTIVATED_RESP => {
            if dgi.read_u32()? != token {
                return Ok(false);
            }
            let do_id = dgi.read_u32()?;
            let activated = dgi.read_bool()?;
            println!(
                "Object {} is {}",
                do_id,
                if activated { "active" } else { "not active" }
            );
            Ok(true)
        }
        other => {
            println!("Ignoring message type {} from {}", other, header.sender);
            Ok(false)
        }
    }
}

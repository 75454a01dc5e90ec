//! Line-oriented chat console: command parsing and execution against the engine.

use nowchat_core::{
    BlobStore, OutgoingTarget, ProtocolEngine, RadioLink, UiEventSink,
};

pub const HELP: &str = "\
text                 broadcast on the current channel
/channel <n>         switch channel (0-255)
/dm <device-id> <t>  direct message to a known peer
/knock <device-id>   ask a peer to admit you
/allow, /deny        answer the last knock (plain `allow` works too)
/peers               list known peers
/send <blob> [id]    send <blob>.blob to everyone or one peer
/abort <id>          stop an outgoing or incoming transfer
/stats               link counters
/quit                exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Say(String),
    Channel(u8),
    Dm { to: String, text: String },
    Knock(String),
    Allow,
    Deny,
    Peers,
    Send { blob: String, to: Option<String> },
    Abort(String),
    Stats,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("unknown command /{0}, try /help")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
}

/// Parse one input line. Blank lines are `Ok(None)`.
pub fn parse(line: &str) -> Result<Option<Command>, CommandError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    if line == "allow" {
        return Ok(Some(Command::Allow));
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Say(line.to_string())));
    };
    let (name, args) = match rest.split_once(char::is_whitespace) {
        Some((n, a)) => (n, a.trim()),
        None => (rest, ""),
    };
    let mut words = args.split_whitespace();
    let cmd = match name {
        "channel" => {
            let n = words
                .next()
                .and_then(|w| w.parse().ok())
                .ok_or(CommandError::Usage("/channel <0-255>"))?;
            Command::Channel(n)
        }
        "dm" => {
            let (to, text) = args
                .split_once(char::is_whitespace)
                .map(|(to, text)| (to, text.trim()))
                .filter(|(_, text)| !text.is_empty())
                .ok_or(CommandError::Usage("/dm <device-id> <text>"))?;
            Command::Dm {
                to: to.to_string(),
                text: text.to_string(),
            }
        }
        "knock" => Command::Knock(
            words
                .next()
                .ok_or(CommandError::Usage("/knock <device-id>"))?
                .to_string(),
        ),
        "allow" => Command::Allow,
        "deny" => Command::Deny,
        "peers" => Command::Peers,
        "send" => {
            let blob = words
                .next()
                .ok_or(CommandError::Usage("/send <blob> [device-id]"))?
                .to_string();
            Command::Send {
                blob,
                to: words.next().map(str::to_string),
            }
        }
        "abort" => Command::Abort(
            words
                .next()
                .ok_or(CommandError::Usage("/abort <id>"))?
                .to_string(),
        ),
        "stats" => Command::Stats,
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(CommandError::Unknown(other.to_string())),
    };
    Ok(Some(cmd))
}

/// What the loop should do after a command.
#[derive(Debug, PartialEq, Eq)]
pub enum Reply {
    Lines(Vec<String>),
    Quit,
}

impl Reply {
    fn none() -> Self {
        Reply::Lines(Vec::new())
    }

    fn line(s: impl Into<String>) -> Self {
        Reply::Lines(vec![s.into()])
    }
}

/// Console state that outlives a single command.
pub struct Console<B: BlobStore> {
    pub channel: u8,
    store: B,
}

impl<B: BlobStore> Console<B> {
    pub fn new(store: B) -> Self {
        Self { channel: 0, store }
    }

    pub fn execute<L: RadioLink, S: UiEventSink>(
        &mut self,
        engine: &mut ProtocolEngine<L, S>,
        cmd: Command,
        now_ms: u64,
    ) -> anyhow::Result<Reply> {
        Ok(match cmd {
            Command::Say(text) => {
                engine.send_broadcast(&text, self.channel, now_ms)?;
                Reply::none()
            }
            Command::Channel(n) => {
                self.channel = n;
                Reply::line(format!("channel {n}"))
            }
            Command::Dm { to, text } => {
                engine.send_direct(&to, &text, now_ms)?;
                Reply::none()
            }
            Command::Knock(to) => {
                engine.send_knock(&to, now_ms)?;
                Reply::line(format!("knocked on {to}"))
            }
            Command::Allow => {
                engine.allow_knock(now_ms)?;
                Reply::none()
            }
            Command::Deny => {
                engine.deny_knock(now_ms)?;
                Reply::none()
            }
            Command::Peers => Reply::Lines(peer_lines(engine, now_ms)),
            Command::Send { blob, to } => {
                let target = match &to {
                    Some(id) => OutgoingTarget::Direct {
                        device_id: nowchat_core::text::bounded(id),
                    },
                    None => OutgoingTarget::Broadcast {
                        channel: self.channel,
                    },
                };
                engine.send_blob_from(&self.store, &blob, target)?;
                Reply::line(format!("sending {blob}"))
            }
            Command::Abort(id) => {
                let outgoing = engine.cancel_outgoing(&id);
                let incoming = engine.abort_transfer(&id);
                if outgoing || incoming {
                    Reply::line(format!("aborted {id}"))
                } else {
                    Reply::line(format!("no transfer {id}"))
                }
            }
            Command::Stats => {
                let s = engine.stats();
                Reply::Lines(vec![
                    format!("sent      {} frames, {} bytes, {} failed", s.messages_sent, s.bytes_sent, s.send_failures),
                    format!("received  {} frames, {} bytes", s.messages_received, s.bytes_received),
                    format!(
                        "dropped   {} invalid, {} unauthenticated, {} queue full",
                        s.validation_drops, s.auth_drops, s.queue_full_drops
                    ),
                    format!(
                        "stale     {} during key change, {} under an old key",
                        s.key_busy_drops, s.stale_drops
                    ),
                ])
            }
            Command::Help => Reply::Lines(HELP.lines().map(str::to_string).collect()),
            Command::Quit => Reply::Quit,
        })
    }
}

fn peer_lines<L: RadioLink, S: UiEventSink>(engine: &ProtocolEngine<L, S>, now_ms: u64) -> Vec<String> {
    if engine.peers().is_empty() {
        return vec!["no peers".to_string()];
    }
    engine
        .peers()
        .iter()
        .map(|p| {
            let signal = p
                .smoothed_signal
                .map(|s| format!("{s} dBm"))
                .unwrap_or_else(|| "-".to_string());
            format!(
                "{:<15} {:<15} {} {:>8} {}s ago",
                p.device_id,
                p.display_name,
                p.address,
                signal,
                now_ms.saturating_sub(p.last_seen_ms) / 1000
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nowchat_core::{DeviceIdentity, LinkAddress, MemoryBlobStore, SecurityManager, UiEvent, BLOB_SIZE};

    struct Loopback(Vec<Vec<u8>>);

    impl RadioLink for Loopback {
        fn send(&mut self, _address: &LinkAddress, frame: &[u8]) -> bool {
            self.0.push(frame.to_vec());
            true
        }
    }

    fn engine() -> ProtocolEngine<Loopback, Vec<UiEvent>> {
        let mut sm = SecurityManager::new(DeviceIdentity::new("LAB0000000A", "Ada"));
        sm.join_network("correct horse").unwrap();
        ProtocolEngine::new(sm, Loopback(Vec::new()), Vec::new())
    }

    #[test]
    fn parses_commands() {
        assert_eq!(parse("  "), Ok(None));
        assert_eq!(parse("hi there"), Ok(Some(Command::Say("hi there".into()))));
        assert_eq!(parse("/channel 3"), Ok(Some(Command::Channel(3))));
        assert_eq!(
            parse("/dm B123 see you at 5"),
            Ok(Some(Command::Dm {
                to: "B123".into(),
                text: "see you at 5".into()
            }))
        );
        assert_eq!(
            parse("/send cat"),
            Ok(Some(Command::Send {
                blob: "cat".into(),
                to: None
            }))
        );
        assert_eq!(parse("/quit"), Ok(Some(Command::Quit)));
        assert_eq!(parse("allow"), Ok(Some(Command::Allow)));
        assert_eq!(parse("/deny"), Ok(Some(Command::Deny)));
        assert_eq!(parse("allow me"), Ok(Some(Command::Say("allow me".into()))));
    }

    #[test]
    fn rejects_bad_commands() {
        assert!(matches!(parse("/channel 300"), Err(CommandError::Usage(_))));
        assert!(matches!(parse("/dm B123"), Err(CommandError::Usage(_))));
        assert!(matches!(parse("/knock"), Err(CommandError::Usage(_))));
        assert_eq!(parse("/frobnicate"), Err(CommandError::Unknown("frobnicate".into())));
    }

    #[test]
    fn say_uses_current_channel() {
        let mut e = engine();
        let mut console = Console::new(MemoryBlobStore::new());
        console.execute(&mut e, Command::Channel(4), 0).unwrap();
        console.execute(&mut e, Command::Say("hello".into()), 0).unwrap();
        let line = e.display().get(0).unwrap();
        assert_eq!(line.channel, 4);
        assert!(line.own);
        assert_eq!(e.link().0.len(), 1);
    }

    #[test]
    fn send_reads_from_store() {
        let mut e = engine();
        let mut store = MemoryBlobStore::new();
        store.save_blob("cat", &[3u8; BLOB_SIZE]).unwrap();
        let mut console = Console::new(store);

        let reply = console
            .execute(&mut e, Command::Send { blob: "cat".into(), to: None }, 0)
            .unwrap();
        assert_eq!(reply, Reply::Lines(vec!["sending cat".into()]));
        assert_eq!(e.outgoing_transfers().count(), 1);

        let missing = console.execute(&mut e, Command::Send { blob: "dog".into(), to: None }, 0);
        assert!(missing.is_err());
    }

    #[test]
    fn dm_to_stranger_is_an_error() {
        let mut e = engine();
        let mut console = Console::new(MemoryBlobStore::new());
        let err = console
            .execute(&mut e, Command::Dm { to: "B123".into(), text: "hi".into() }, 0)
            .unwrap_err();
        assert!(err.to_string().contains("B123"));
    }

    #[test]
    fn allow_without_a_knock_is_an_error() {
        let mut e = engine();
        let mut console = Console::new(MemoryBlobStore::new());
        let err = console.execute(&mut e, Command::Allow, 0).unwrap_err();
        assert!(err.to_string().contains("knocking"));
    }

    #[test]
    fn peers_and_quit() {
        let mut e = engine();
        let mut console = Console::new(MemoryBlobStore::new());
        assert_eq!(
            console.execute(&mut e, Command::Peers, 0).unwrap(),
            Reply::Lines(vec!["no peers".into()])
        );
        assert_eq!(console.execute(&mut e, Command::Quit, 0).unwrap(), Reply::Quit);
    }
}

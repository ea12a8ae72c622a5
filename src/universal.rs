//! Universal variables: a key/value store shared by every shell of a user,
//! served by the `reefd` daemon over a UNIX socket.
//!
//! The wire protocol is newline-terminated ASCII command lines:
//! `SET name:value`, `SET_EXPORT name:value`, `ERASE name`, `BARRIER`,
//! `BARRIER_REPLY`. Values are escaped so newlines and colons round-trip.
//! The barrier primitive gives the issuing client causal consistency: the
//! server flushes everything pending for that client before replying.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, warn};

use crate::env::ARRAY_SEP;

/// Socket filename prefix; the username is appended.
pub const SOCK_FILENAME: &str = "fishd.socket.";

/// Maximum number of attempts to obtain a server socket.
const RECONNECT_COUNT: u32 = 32;

/// A message in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Set {
        name: String,
        value: String,
        export: bool,
    },
    Erase {
        name: String,
    },
    Barrier,
    BarrierReply,
}

/// Escape a value for transmission. Backslash introduces the escapes; the
/// separator, newlines and all control bytes become `\xHH` so any value
/// round-trips through the line-oriented framing.
pub fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            ':' | '\n' | '\r' => out.push_str(&format!("\\x{:02x}", ch as u32)),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\x{:02x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

/// Invert [`escape_value`]. Returns `None` on malformed input.
pub fn unescape_value(value: &str) -> Option<String> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next()? {
            '\\' => out.push('\\'),
            'x' => {
                let hi = chars.next()?.to_digit(16)?;
                let lo = chars.next()?.to_digit(16)?;
                out.push(char::from_u32(hi * 16 + lo)?);
            }
            _ => return None,
        }
    }
    Some(out)
}

/// Encode a message as one newline-terminated line.
pub fn encode_message(msg: &Message) -> String {
    match msg {
        Message::Set {
            name,
            value,
            export,
        } => {
            let cmd = if *export { "SET_EXPORT" } else { "SET" };
            format!("{cmd} {name}:{}\n", escape_value(value))
        }
        Message::Erase { name } => format!("ERASE {name}\n"),
        Message::Barrier => "BARRIER\n".to_string(),
        Message::BarrierReply => "BARRIER_REPLY\n".to_string(),
    }
}

/// Parse one line (without its trailing newline).
pub fn parse_message(line: &str) -> Option<Message> {
    let line = line.trim_end_matches('\r');
    if line.is_empty() {
        return None;
    }
    if line == "BARRIER" {
        return Some(Message::Barrier);
    }
    if line == "BARRIER_REPLY" {
        return Some(Message::BarrierReply);
    }
    let (cmd, rest) = line.split_once(' ')?;
    match cmd {
        "SET" | "SET_EXPORT" => {
            let (name, raw_value) = rest.split_once(':')?;
            Some(Message::Set {
                name: name.to_string(),
                value: unescape_value(raw_value)?,
                export: cmd == "SET_EXPORT",
            })
        }
        "ERASE" => Some(Message::Erase {
            name: rest.to_string(),
        }),
        _ => None,
    }
}

/// Where the server socket lives: `${DIR}/fishd.socket.${USER}`.
pub fn socket_path(dir: Option<&Path>, user: &str) -> PathBuf {
    let dir = dir.unwrap_or_else(|| Path::new("/tmp"));
    dir.join(format!("{SOCK_FILENAME}{user}"))
}

/// An inbound store change the shell still has to apply to its view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UvarUpdate {
    Set {
        name: String,
        value: String,
        export: bool,
    },
    Erase {
        name: String,
    },
}

/// Callback that starts the daemon when no socket answers.
pub type SpawnDaemon = Box<dyn FnMut()>;

pub struct UniversalClient {
    path: PathBuf,
    stream: Option<UnixStream>,
    /// Framed messages not yet (fully) written; front entry may be partial.
    outbox: VecDeque<Vec<u8>>,
    outbox_sent: usize,
    /// Raw inbound bytes up to the last unterminated line.
    input: Vec<u8>,
    /// Connection fault observed; cleared by reconnecting.
    killme: bool,
    barrier_reply: bool,
    socket_attempts: u32,
    spawn_daemon: Option<SpawnDaemon>,
    /// Local replica of the store.
    vars: HashMap<String, (String, bool)>,
    /// Changes not yet dispatched to the environment/event layer.
    updates: VecDeque<UvarUpdate>,
    export_changed: bool,
}

impl UniversalClient {
    /// Connect to the server, spawning the daemon if nothing is listening,
    /// and synchronise with an initial barrier.
    pub fn init(dir: Option<&Path>, user: &str, spawn_daemon: Option<SpawnDaemon>) -> Self {
        let mut client = UniversalClient {
            path: socket_path(dir, user),
            stream: None,
            outbox: VecDeque::new(),
            outbox_sent: 0,
            input: Vec::new(),
            killme: false,
            barrier_reply: false,
            socket_attempts: 0,
            spawn_daemon,
            vars: HashMap::new(),
            updates: VecDeque::new(),
            export_changed: false,
        };
        client.stream = client.get_socket(true).ok();
        if client.stream.is_some() {
            client.barrier();
        } else {
            debug!("no connection to universal variable server");
        }
        client
    }

    /// A client that never connects; universal sets stay local. Used by
    /// non-interactive shells that opt out of the daemon.
    pub fn disconnected() -> Self {
        UniversalClient {
            path: PathBuf::new(),
            stream: None,
            outbox: VecDeque::new(),
            outbox_sent: 0,
            input: Vec::new(),
            killme: false,
            barrier_reply: false,
            socket_attempts: RECONNECT_COUNT,
            spawn_daemon: None,
            vars: HashMap::new(),
            updates: VecDeque::new(),
            export_changed: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn get_socket(&mut self, spawn_ok: bool) -> Result<UnixStream> {
        self.socket_attempts += 1;
        match UnixStream::connect(&self.path) {
            Ok(stream) => {
                stream
                    .set_nonblocking(true)
                    .context("set universal socket nonblocking")?;
                debug!("connected to universal server at {}", self.path.display());
                Ok(stream)
            }
            Err(err) if spawn_ok && self.spawn_daemon.is_some() => {
                debug!("could not connect ({err}), starting the daemon");
                if let Some(spawn) = self.spawn_daemon.as_mut() {
                    spawn();
                }
                // Give the daemon a moment to bind before the single retry.
                for _ in 0..20 {
                    std::thread::sleep(Duration::from_millis(25));
                    if self.path.exists() {
                        break;
                    }
                }
                self.get_socket(false)
            }
            Err(err) => Err(err).with_context(|| {
                format!("connect to universal socket {}", self.path.display())
            }),
        }
    }

    fn reconnect(&mut self) {
        if self.socket_attempts >= RECONNECT_COUNT {
            return;
        }
        debug!("reconnecting to universal variable server");
        self.stream = self.get_socket(true).ok();
        if self.stream.is_some() {
            self.barrier();
        }
    }

    /// Close a faulted connection and try to establish a fresh one. Any
    /// notifications lost while disconnected are recovered by the barrier
    /// issued on reconnect.
    fn check_connection(&mut self) {
        if !self.killme {
            return;
        }
        warn!("lost connection to universal variable server");
        self.stream = None;
        self.killme = false;
        self.input.clear();
        self.outbox_sent = 0;
        self.read_all();
    }

    /// Read every available message from the server.
    pub fn read_all(&mut self) {
        if self.stream.is_none() {
            self.reconnect();
            if self.stream.is_none() {
                return;
            }
        }
        self.read_pending();
        self.check_connection();
    }

    fn read_pending(&mut self) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        let mut chunk = [0u8; 1024];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => {
                    self.killme = true;
                    break;
                }
                Ok(n) => self.input.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!("universal socket read failed: {err}");
                    self.killme = true;
                    break;
                }
            }
        }
        self.parse_input();
    }

    fn parse_input(&mut self) {
        while let Some(pos) = self.input.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.input.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
            match parse_message(&line) {
                Some(Message::BarrierReply) => {
                    debug!("got barrier reply");
                    self.barrier_reply = true;
                }
                Some(Message::Set {
                    name,
                    value,
                    export,
                }) => self.apply_set(name, value, export),
                Some(Message::Erase { name }) => self.apply_erase(name),
                Some(Message::Barrier) | None => {
                    debug!("unexpected message from server: {line:?}");
                }
            }
        }
    }

    fn apply_set(&mut self, name: String, value: String, export: bool) {
        let previous = self.vars.insert(name.clone(), (value.clone(), export));
        if export || previous.map(|(_, e)| e).unwrap_or(false) {
            self.export_changed = true;
        }
        self.updates.push_back(UvarUpdate::Set {
            name,
            value,
            export,
        });
    }

    fn apply_erase(&mut self, name: String) {
        if let Some((_, exported)) = self.vars.remove(&name) {
            if exported {
                self.export_changed = true;
            }
        }
        self.updates.push_back(UvarUpdate::Erase { name });
    }

    /// Write as much of the outbox as the socket accepts without blocking.
    fn try_send_all(&mut self) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        while let Some(front) = self.outbox.front() {
            match stream.write(&front[self.outbox_sent..]) {
                Ok(n) => {
                    self.outbox_sent += n;
                    if self.outbox_sent == front.len() {
                        self.outbox.pop_front();
                        self.outbox_sent = 0;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!("universal socket write failed: {err}");
                    self.killme = true;
                    break;
                }
            }
        }
    }

    fn poll_socket(&self, events: libc::c_short) {
        let Some(stream) = self.stream.as_ref() else {
            return;
        };
        let mut pfd = libc::pollfd {
            fd: stream.as_raw_fd(),
            events,
            revents: 0,
        };
        unsafe {
            libc::poll(&mut pfd, 1, 1000);
        }
    }

    /// Block until the server has flushed all traffic for this client and
    /// answered our barrier. All prior universal writes by anyone are
    /// observable locally once this returns.
    pub fn barrier(&mut self) {
        if self.stream.is_none() {
            return;
        }
        self.barrier_reply = false;
        self.enqueue(Message::Barrier);

        debug!("sending barrier");
        loop {
            self.try_send_all();
            self.check_connection();
            if self.outbox.is_empty() {
                break;
            }
            if self.stream.is_none() {
                self.reconnect();
                return;
            }
            self.poll_socket(libc::POLLOUT);
        }

        while !self.barrier_reply {
            if self.stream.is_none() {
                self.reconnect();
                return;
            }
            self.poll_socket(libc::POLLIN);
            self.read_all();
        }
        debug!("barrier complete");
    }

    fn enqueue(&mut self, msg: Message) {
        self.outbox.push_back(encode_message(&msg).into_bytes());
    }

    /// Publish a variable. The local replica is updated immediately; the
    /// barrier makes the write durable at the server before returning.
    pub fn set(&mut self, name: &str, value: &str, export: bool) {
        debug!("universal set {name}");
        let previous = self
            .vars
            .insert(name.to_string(), (value.to_string(), export));
        if export || previous.map(|(_, e)| e).unwrap_or(false) {
            self.export_changed = true;
        }
        self.enqueue(Message::Set {
            name: name.to_string(),
            value: value.to_string(),
            export,
        });
        self.barrier();
    }

    /// Remove a variable everywhere.
    pub fn erase(&mut self, name: &str) {
        debug!("universal erase {name}");
        if let Some((_, exported)) = self.vars.remove(name) {
            if exported {
                self.export_changed = true;
            }
        }
        self.enqueue(Message::Erase {
            name: name.to_string(),
        });
        self.barrier();
    }

    pub fn get(&self, name: &str) -> Option<&(String, bool)> {
        self.vars.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut out: Vec<String> = self.vars.keys().cloned().collect();
        out.sort();
        out
    }

    /// Exported universal `(name, value)` pairs with the array separator
    /// converted to `:` for the exec environment.
    pub fn exported_pairs(&self) -> Vec<(String, String)> {
        self.vars
            .iter()
            .filter(|(_, (_, exported))| *exported)
            .map(|(name, (value, _))| {
                let converted: String = value
                    .chars()
                    .map(|c| if c == ARRAY_SEP { ':' } else { c })
                    .collect();
                (name.clone(), converted)
            })
            .collect()
    }

    /// Store changes received since the last drain, oldest first.
    pub fn take_updates(&mut self) -> Vec<UvarUpdate> {
        self.updates.drain(..).collect()
    }

    pub fn take_export_changed(&mut self) -> bool {
        std::mem::take(&mut self.export_changed)
    }

    /// Raw fd of the live connection, for the child-side close sweep.
    pub fn socket_fd(&self) -> Option<i32> {
        self.stream.as_ref().map(|s| s.as_raw_fd())
    }

    /// Flush remaining traffic in blocking mode before shutdown.
    pub fn destroy(&mut self) {
        if let Some(stream) = self.stream.as_ref() {
            let _ = stream.set_nonblocking(false);
        }
        self.try_send_all();
        self.stream = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_byte_round_trips_through_escaping() {
        let value: String = (1u32..=0xff).map(|c| char::from_u32(c).unwrap()).collect();
        let escaped = escape_value(&value);
        assert!(!escaped.contains('\n'));
        assert!(!escaped.contains(':'));
        assert_eq!(unescape_value(&escaped).unwrap(), value);
    }

    #[test]
    fn set_message_round_trips() {
        let msg = Message::Set {
            name: "FOO".into(),
            value: "colon : and\nnewline".into(),
            export: false,
        };
        let line = encode_message(&msg);
        assert!(line.ends_with('\n'));
        assert_eq!(parse_message(line.trim_end_matches('\n')).unwrap(), msg);
    }

    #[test]
    fn export_flag_selects_command_word() {
        let msg = Message::Set {
            name: "X".into(),
            value: "1".into(),
            export: true,
        };
        assert!(encode_message(&msg).starts_with("SET_EXPORT "));
    }

    #[test]
    fn control_messages_parse() {
        assert_eq!(parse_message("BARRIER"), Some(Message::Barrier));
        assert_eq!(parse_message("BARRIER_REPLY"), Some(Message::BarrierReply));
        assert_eq!(
            parse_message("ERASE FOO"),
            Some(Message::Erase { name: "FOO".into() })
        );
        assert_eq!(parse_message("NONSENSE"), None);
        assert_eq!(parse_message(""), None);
    }

    #[test]
    fn socket_path_uses_dir_and_user() {
        let path = socket_path(Some(Path::new("/run/me")), "alice");
        assert_eq!(path, PathBuf::from("/run/me/fishd.socket.alice"));
        let default = socket_path(None, "bob");
        assert_eq!(default, PathBuf::from("/tmp/fishd.socket.bob"));
    }

    #[test]
    fn disconnected_client_keeps_sets_local() {
        let mut client = UniversalClient::disconnected();
        client.set("FOO", "bar", false);
        assert_eq!(client.get("FOO"), Some(&("bar".to_string(), false)));
        client.erase("FOO");
        assert!(client.get("FOO").is_none());
    }

    #[test]
    fn inbound_set_queues_an_update_and_dirties_exports() {
        let mut client = UniversalClient::disconnected();
        client.apply_set("LANG".into(), "C".into(), true);
        assert!(client.take_export_changed());
        assert_eq!(
            client.take_updates(),
            vec![UvarUpdate::Set {
                name: "LANG".into(),
                value: "C".into(),
                export: true,
            }]
        );
        assert!(client.take_updates().is_empty());
    }
}

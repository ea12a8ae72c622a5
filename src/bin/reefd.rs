//! reefd: the universal variable daemon.
//!
//! Holds the user's cross-shell key/value store and serves it over a UNIX
//! socket. Accepted `SET`/`SET_EXPORT`/`ERASE` commands are applied to the
//! store and fanned out to every other connected client; `BARRIER` is
//! answered with `BARRIER_REPLY` only after everything already queued for
//! that client has been flushed, which is what gives the issuing client
//! causal consistency. The store is persisted to a file so variables
//! survive reboots.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;

use anyhow::{Context, Result};
use log::{debug, info, warn};

use reef::universal::{encode_message, parse_message, socket_path, Message};

struct Client {
    stream: UnixStream,
    input: Vec<u8>,
    outbox: VecDeque<Vec<u8>>,
    sent: usize,
    dead: bool,
}

impl Client {
    fn new(stream: UnixStream) -> Self {
        Client {
            stream,
            input: Vec::new(),
            outbox: VecDeque::new(),
            sent: 0,
            dead: false,
        }
    }

    fn queue(&mut self, line: String) {
        self.outbox.push_back(line.into_bytes());
    }

    fn flush(&mut self) {
        while let Some(front) = self.outbox.front() {
            match self.stream.write(&front[self.sent..]) {
                Ok(n) => {
                    self.sent += n;
                    if self.sent == front.len() {
                        self.outbox.pop_front();
                        self.sent = 0;
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(_) => {
                    self.dead = true;
                    break;
                }
            }
        }
    }

    fn read_lines(&mut self) -> Vec<String> {
        let mut chunk = [0u8; 1024];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    self.dead = true;
                    break;
                }
                Ok(n) => self.input.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(_) => {
                    self.dead = true;
                    break;
                }
            }
        }
        let mut lines = Vec::new();
        while let Some(pos) = self.input.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.input.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line[..line.len() - 1]).into_owned());
        }
        lines
    }
}

/// The store: name -> (value, exported).
type Store = HashMap<String, (String, bool)>;

fn store_file() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".reefd"))
}

/// Load persisted variables. The file uses the wire format, one SET per
/// line, so the parser is shared with the socket.
fn load_store() -> Store {
    let mut store = Store::new();
    let Some(path) = store_file() else {
        return store;
    };
    let Ok(contents) = fs::read_to_string(&path) else {
        return store;
    };
    for line in contents.lines() {
        if let Some(Message::Set {
            name,
            value,
            export,
        }) = parse_message(line)
        {
            store.insert(name, (value, export));
        }
    }
    debug!("loaded {} variables from {}", store.len(), path.display());
    store
}

fn save_store(store: &Store) {
    let Some(path) = store_file() else {
        return;
    };
    let mut out = String::new();
    for (name, (value, export)) in store {
        out.push_str(&encode_message(&Message::Set {
            name: name.clone(),
            value: value.clone(),
            export: *export,
        }));
    }
    if let Err(err) = fs::write(&path, out) {
        warn!("could not save store to {}: {err}", path.display());
    }
}

/// Apply one inbound command. Returns the line to fan out to the other
/// clients, if any.
fn handle_command(store: &mut Store, line: &str, sender: &mut Client) -> Option<String> {
    match parse_message(line) {
        Some(Message::Set {
            name,
            value,
            export,
        }) => {
            debug!("set {name}");
            store.insert(name.clone(), (value.clone(), export));
            save_store(store);
            Some(encode_message(&Message::Set {
                name,
                value,
                export,
            }))
        }
        Some(Message::Erase { name }) => {
            debug!("erase {name}");
            store.remove(&name);
            save_store(store);
            Some(encode_message(&Message::Erase { name }))
        }
        Some(Message::Barrier) => {
            // Everything queued before this reply is flushed first; the
            // outbox is FIFO, so ordering does the work.
            sender.queue(encode_message(&Message::BarrierReply));
            None
        }
        Some(Message::BarrierReply) | None => {
            debug!("ignoring unexpected message: {line:?}");
            None
        }
    }
}

fn run() -> Result<()> {
    let socket_dir = std::env::var_os("REEF_SOCKET_DIR").map(PathBuf::from);
    let user = std::env::var("USER").unwrap_or_else(|_| "nobody".to_string());
    let path = socket_path(socket_dir.as_deref(), &user);

    // Another daemon already serving? Leave it to its work.
    if UnixStream::connect(&path).is_ok() {
        info!("another daemon is already listening on {}", path.display());
        return Ok(());
    }
    let _ = fs::remove_file(&path);

    let listener = UnixListener::bind(&path)
        .with_context(|| format!("bind universal socket {}", path.display()))?;
    listener
        .set_nonblocking(true)
        .context("set listener nonblocking")?;
    info!("serving universal variables on {}", path.display());

    let mut store = load_store();
    let mut clients: Vec<Client> = Vec::new();

    loop {
        let mut pollfds: Vec<libc::pollfd> = Vec::with_capacity(clients.len() + 1);
        pollfds.push(libc::pollfd {
            fd: listener.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        for client in &clients {
            let mut events = libc::POLLIN;
            if !client.outbox.is_empty() {
                events |= libc::POLLOUT;
            }
            pollfds.push(libc::pollfd {
                fd: client.stream.as_raw_fd(),
                events,
                revents: 0,
            });
        }

        let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, -1) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err).context("poll");
        }

        // Clients polled this round; ones accepted below wait a turn.
        let polled = pollfds.len() - 1;

        // New connections get the whole store replayed.
        if pollfds[0].revents & libc::POLLIN != 0 {
            loop {
                match listener.accept() {
                    Ok((stream, _)) => {
                        if stream.set_nonblocking(true).is_err() {
                            continue;
                        }
                        let mut client = Client::new(stream);
                        for (name, (value, export)) in &store {
                            client.queue(encode_message(&Message::Set {
                                name: name.clone(),
                                value: value.clone(),
                                export: *export,
                            }));
                        }
                        debug!("new client connected");
                        clients.push(client);
                    }
                    Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                    Err(err) => {
                        warn!("accept failed: {err}");
                        break;
                    }
                }
            }
        }

        for idx in 0..polled {
            let revents = pollfds[idx + 1].revents;
            if revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
                let lines = clients[idx].read_lines();
                for line in lines {
                    let fanout = handle_command(&mut store, &line, &mut clients[idx]);
                    if let Some(message) = fanout {
                        for (other_idx, other) in clients.iter_mut().enumerate() {
                            if other_idx != idx {
                                other.queue(message.clone());
                            }
                        }
                    }
                }
            }
            if revents & libc::POLLOUT != 0 {
                clients[idx].flush();
            }
        }

        // Opportunistic flush so barrier replies do not wait for the next
        // POLLOUT wakeup.
        for client in &mut clients {
            client.flush();
        }

        clients.retain(|c| {
            if c.dead {
                debug!("client disconnected");
            }
            !c.dead
        });
    }
}

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("reefd: {err:#}");
        std::process::exit(1);
    }
}

//! An in-process server speaking enough RESP for tests: `AUTH`, `SELECT`,
//! `INCRBY`, `PING` and `SENTINEL get-master-addr-by-name`.

use super::resp::{self, Value};
use bytes::BytesMut;
use parking_lot::Mutex;
use portable_atomic::{AtomicU32, Ordering};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[derive(Debug, Default)]
struct State {
    password: Option<String>,
    /// Service name and primary address when acting as a sentinel.
    sentinel: Option<(String, SocketAddr)>,
    silent: bool,
    counters: Mutex<HashMap<String, i64>>,
    commands: Mutex<Vec<Vec<String>>>,
    drop_next: AtomicU32,
    connections: AtomicU32,
}

pub(crate) struct FakeRedis {
    addr: SocketAddr,
    state: Arc<State>,
}

impl FakeRedis {
    pub(crate) async fn start() -> Self {
        Self::spawn(State::default()).await
    }

    pub(crate) async fn with_password(password: &str) -> Self {
        Self::spawn(State {
            password: Some(password.to_owned()),
            ..State::default()
        })
        .await
    }

    /// A sentinel that reports `primary` for `service`.
    pub(crate) async fn sentinel(service: &str, primary: SocketAddr) -> Self {
        Self::spawn(State {
            sentinel: Some((service.to_owned(), primary)),
            ..State::default()
        })
        .await
    }

    /// Accepts connections and reads commands but never answers.
    pub(crate) async fn silent() -> Self {
        Self::spawn(State {
            silent: true,
            ..State::default()
        })
        .await
    }

    /// An address nothing listens on.
    pub(crate) async fn unused_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    async fn spawn(state: State) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(state);
        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                accept_state.connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(socket, Arc::clone(&accept_state)));
            }
        });
        Self { addr, state }
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub(crate) fn counter(&self, key: &str) -> Option<i64> {
        self.state.counters.lock().get(key).copied()
    }

    /// Sets a counter directly.
    pub(crate) fn set_counter(&self, key: &str, value: i64) {
        self.state.counters.lock().insert(key.to_owned(), value);
    }

    pub(crate) fn commands(&self) -> Vec<Vec<String>> {
        self.state.commands.lock().clone()
    }

    /// Closes the connection instead of answering the next `n` commands.
    pub(crate) fn drop_next(&self, n: u32) {
        self.state.drop_next.store(n, Ordering::SeqCst);
    }

    pub(crate) fn connections(&self) -> u32 {
        self.state.connections.load(Ordering::SeqCst)
    }
}

async fn serve(mut socket: TcpStream, state: Arc<State>) {
    let mut buf = BytesMut::with_capacity(256);
    let mut authenticated = state.password.is_none();
    loop {
        let command = loop {
            match resp::decode(&mut buf) {
                Ok(Some(value)) => break value,
                Ok(None) => {}
                Err(_) => return,
            }
            match socket.read_buf(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        };
        let Some(args) = command_args(command) else {
            return;
        };
        state.commands.lock().push(args.clone());

        if state
            .drop_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return;
        }
        if state.silent {
            continue;
        }

        let reply = respond(&state, &mut authenticated, &args);
        if socket.write_all(reply.as_bytes()).await.is_err() {
            return;
        }
    }
}

fn command_args(value: Value) -> Option<Vec<String>> {
    let Value::Array(Some(items)) = value else {
        return None;
    };
    items
        .into_iter()
        .map(|item| match item {
            Value::Bulk(Some(bytes)) => String::from_utf8(bytes.to_vec()).ok(),
            _ => None,
        })
        .collect()
}

fn respond(state: &State, authenticated: &mut bool, args: &[String]) -> String {
    let name = args[0].to_ascii_uppercase();
    if name == "AUTH" {
        // The last argument is the password with or without a user name.
        return match (&state.password, args.last()) {
            (Some(expected), Some(given)) if args.len() > 1 && expected == given => {
                *authenticated = true;
                "+OK\r\n".to_owned()
            }
            _ => "-WRONGPASS invalid username-password pair\r\n".to_owned(),
        };
    }
    if !*authenticated {
        return "-NOAUTH Authentication required.\r\n".to_owned();
    }

    match (name.as_str(), &args[1..]) {
        ("PING", []) => "+PONG\r\n".to_owned(),
        ("SELECT", [_db]) => "+OK\r\n".to_owned(),
        ("INCRBY", [key, by]) => {
            let Ok(by) = by.parse::<i64>() else {
                return "-ERR value is not an integer or out of range\r\n".to_owned();
            };
            let mut counters = state.counters.lock();
            let counter = counters.entry(key.clone()).or_default();
            *counter += by;
            format!(":{counter}\r\n")
        }
        ("SENTINEL", [sub, service]) if sub.eq_ignore_ascii_case("get-master-addr-by-name") => {
            match &state.sentinel {
                Some((known, primary)) if known == service => {
                    let host = primary.ip().to_string();
                    let port = primary.port().to_string();
                    format!(
                        "*2\r\n${}\r\n{host}\r\n${}\r\n{port}\r\n",
                        host.len(),
                        port.len()
                    )
                }
                _ => "*-1\r\n".to_owned(),
            }
        }
        _ => format!("-ERR unknown command '{}'\r\n", args[0]),
    }
}

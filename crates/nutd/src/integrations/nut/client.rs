use std::io::BufRead;
use std::io::BufReader;
use std::io::Write;
use std::net::TcpStream;
use std::net::ToSocketAddrs;
use std::time::Duration;

use tracing::trace;

use super::config::EntryData;
use super::status::Status;

/// Timeout applied to connecting and to every read/write on the socket
const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors returned by a NUT client
#[derive(Debug, thiserror::Error)]
pub enum NutError {
    /// The server answered with `ERR <code>`
    #[error("NUT server returned error: {0}")]
    Protocol(String),

    /// The server answered with something we could not parse
    #[error("unexpected response from NUT server: {0:?}")]
    UnexpectedResponse(String),

    /// Connecting, reading or writing failed (refused, reset, timed out, ...)
    #[error("NUT connection error: {0}")]
    Connection(#[from] std::io::Error),
}

/// Blocking NUT client operations
///
/// Calls block on network IO; callers on the async runtime must run them on a
/// blocking worker. This trait allows for mocking the client in tests.
pub trait NutClient: Send + 'static {
    /// List the UPS aliases known to the server, in server order, with their
    /// descriptions
    fn list_ups(&mut self) -> Result<Vec<(String, String)>, NutError>;

    /// List every variable of one UPS
    fn list_vars(&mut self, ups: &str) -> Result<Status, NutError>;
}

/// Builds one client per config entry
pub trait ClientFactory: Send + Sync + 'static {
    type Client: NutClient;

    fn create(&self, data: &EntryData) -> Self::Client;
}

/// Real NUT client speaking the text protocol over TCP
///
/// No connection is kept between calls: each request connects, optionally
/// logs in, runs a single `LIST` command and logs out.
#[derive(Debug, Clone)]
pub struct TcpNutClient {
    host: String,
    port: u16,
    username: Option<String>,
    password: Option<String>,
    timeout: Duration,
}

impl TcpNutClient {
    pub fn new(data: &EntryData) -> Self {
        Self {
            host: data.host.clone(),
            port: data.port,
            username: data.username.clone(),
            password: data.password.clone(),
            timeout: IO_TIMEOUT,
        }
    }

    fn connect(&self) -> Result<Session, NutError> {
        let mut last_err = None;
        for addr in (self.host.as_str(), self.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(self.timeout))?;
                    stream.set_write_timeout(Some(self.timeout))?;
                    let mut session = Session::new(stream)?;
                    if let Some(username) = &self.username {
                        session.simple_command(&format!("USERNAME {}", quote(username)))?;
                    }
                    if let Some(password) = &self.password {
                        session.simple_command(&format!("PASSWORD {}", quote(password)))?;
                    }
                    return Ok(session);
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(NutError::Connection(last_err.unwrap_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no addresses found for {}", self.host),
            )
        })))
    }
}

impl NutClient for TcpNutClient {
    fn list_ups(&mut self) -> Result<Vec<(String, String)>, NutError> {
        let mut session = self.connect()?;
        let rows = session.list("UPS")?;
        session.logout();

        rows.into_iter()
            .map(|row| match row.as_slice() {
                [kind, name, desc] if kind == "UPS" => Ok((name.clone(), desc.clone())),
                _ => Err(NutError::UnexpectedResponse(row.join(" "))),
            })
            .collect()
    }

    fn list_vars(&mut self, ups: &str) -> Result<Status, NutError> {
        let mut session = self.connect()?;
        let rows = session.list(&format!("VAR {}", ups))?;
        session.logout();

        rows.into_iter()
            .map(|row| match row.as_slice() {
                [kind, _ups, key, value] if kind == "VAR" => Ok((key.clone(), value.clone())),
                _ => Err(NutError::UnexpectedResponse(row.join(" "))),
            })
            .collect()
    }
}

/// Creates a [`TcpNutClient`] for each entry
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpClientFactory;

impl ClientFactory for TcpClientFactory {
    type Client = TcpNutClient;

    fn create(&self, data: &EntryData) -> TcpNutClient {
        TcpNutClient::new(data)
    }
}

/// One open connection to the server
struct Session {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Session {
    fn new(stream: TcpStream) -> std::io::Result<Self> {
        let writer = stream.try_clone()?;
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
        })
    }

    fn send(&mut self, line: &str) -> Result<(), NutError> {
        trace!("NUT >> {}", line.split_whitespace().next().unwrap_or_default());
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    fn recv(&mut self) -> Result<String, NutError> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(NutError::Connection(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection closed by NUT server",
            )));
        }
        let line = line.trim_end_matches(['\r', '\n']).to_string();
        trace!("NUT << {}", line);

        if let Some(code) = line.strip_prefix("ERR ") {
            return Err(NutError::Protocol(code.trim().to_string()));
        }
        Ok(line)
    }

    /// Send a command answered by a single `OK` line
    fn simple_command(&mut self, line: &str) -> Result<(), NutError> {
        self.send(line)?;
        let reply = self.recv()?;
        if reply == "OK" || reply.starts_with("OK ") {
            Ok(())
        } else {
            Err(NutError::UnexpectedResponse(reply))
        }
    }

    /// Run `LIST <query>` and return the tokenized rows between the
    /// `BEGIN LIST` and `END LIST` markers
    fn list(&mut self, query: &str) -> Result<Vec<Vec<String>>, NutError> {
        self.send(&format!("LIST {}", query))?;

        let begin = self.recv()?;
        if begin != format!("BEGIN LIST {}", query) {
            return Err(NutError::UnexpectedResponse(begin));
        }

        let end = format!("END LIST {}", query);
        let mut rows = Vec::new();
        loop {
            let line = self.recv()?;
            if line == end {
                return Ok(rows);
            }
            rows.push(tokenize(&line)?);
        }
    }

    fn logout(mut self) {
        // The server closes the socket after LOGOUT; the reply is irrelevant.
        if self.send("LOGOUT").is_ok() {
            let _ = self.recv();
        }
    }
}

/// Split a response line into words, honouring double quotes and backslash
/// escapes inside them
fn tokenize(line: &str) -> Result<Vec<String>, NutError> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        let mut token = String::new();
        if c == '"' {
            chars.next();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' => match chars.next() {
                        Some(escaped) => token.push(escaped),
                        None => break,
                    },
                    '"' => {
                        closed = true;
                        break;
                    }
                    c => token.push(c),
                }
            }
            if !closed {
                return Err(NutError::UnexpectedResponse(line.to_string()));
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                token.push(c);
                chars.next();
            }
        }
        tokens.push(token);
    }

    Ok(tokens)
}

fn quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{}\"", escaped)
}

/// Failure a [`MockNutClient`] can be told to produce
#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    Protocol,
    ConnectionReset,
}

#[cfg(test)]
impl MockFailure {
    fn to_error(self) -> NutError {
        match self {
            MockFailure::Protocol => NutError::Protocol("UNKNOWN-UPS".to_string()),
            MockFailure::ConnectionReset => NutError::Connection(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            )),
        }
    }
}

#[cfg(test)]
#[derive(Debug, Default)]
struct MockState {
    ups: Vec<(String, String)>,
    vars: std::collections::HashMap<String, Status>,
    list_ups_failure: Option<MockFailure>,
    list_vars_failure: Option<MockFailure>,
    list_ups_calls: usize,
    list_vars_calls: Vec<String>,
}

/// Mock NUT client for testing
///
/// Clones share state, so a test can keep one handle to change responses after
/// the integration has taken its own copy.
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub struct MockNutClient {
    state: std::sync::Arc<std::sync::Mutex<MockState>>,
}

#[cfg(test)]
impl MockNutClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Add a UPS with the given variables
    pub fn with_ups(self, name: &str, vars: &[(&str, &str)]) -> Self {
        self.set_vars(name, vars);
        self.state()
            .ups
            .push((name.to_string(), format!("{} description", name)));
        self
    }

    pub fn set_vars(&self, name: &str, vars: &[(&str, &str)]) {
        let status = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.state().vars.insert(name.to_string(), status);
    }

    pub fn fail_list_ups(&self, failure: Option<MockFailure>) {
        self.state().list_ups_failure = failure;
    }

    pub fn fail_list_vars(&self, failure: Option<MockFailure>) {
        self.state().list_vars_failure = failure;
    }

    pub fn list_ups_calls(&self) -> usize {
        self.state().list_ups_calls
    }

    pub fn list_vars_calls(&self) -> Vec<String> {
        self.state().list_vars_calls.clone()
    }
}

#[cfg(test)]
impl NutClient for MockNutClient {
    fn list_ups(&mut self) -> Result<Vec<(String, String)>, NutError> {
        let mut state = self.state();
        state.list_ups_calls += 1;
        if let Some(failure) = state.list_ups_failure {
            return Err(failure.to_error());
        }
        Ok(state.ups.clone())
    }

    fn list_vars(&mut self, ups: &str) -> Result<Status, NutError> {
        let mut state = self.state();
        state.list_vars_calls.push(ups.to_string());
        if let Some(failure) = state.list_vars_failure {
            return Err(failure.to_error());
        }
        state
            .vars
            .get(ups)
            .cloned()
            .ok_or_else(|| NutError::Protocol("UNKNOWN-UPS".to_string()))
    }
}

#[cfg(test)]
impl ClientFactory for MockNutClient {
    type Client = MockNutClient;

    fn create(&self, _data: &EntryData) -> MockNutClient {
        self.clone()
    }
}

/// The provider's redirect back to the application
use crate::error::{AuthError, Result};
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};
use url::Url;

/// Authorization code and state echoed by the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: String,
    pub state: String,
}

impl CallbackParams {
    /// Extract the callback parameters from a redirect URL
    ///
    /// Returns `None` unless both `code` and `state` are present. A provider
    /// `error` parameter is returned as [`AuthError::AuthorizationDenied`].
    pub fn from_url(href: &str) -> Result<Option<Self>> {
        let url = Url::parse(href)?;

        let mut code = None;
        let mut state = None;
        let mut error = None;
        let mut description = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "code" => code = Some(value.into_owned()),
                "state" => state = Some(value.into_owned()),
                "error" => error = Some(value.into_owned()),
                "error_description" => description = Some(value.into_owned()),
                _ => {}
            }
        }

        if let Some(error) = error {
            return Err(AuthError::AuthorizationDenied { error, description });
        }

        Ok(match (code, state) {
            (Some(code), Some(state)) if !code.is_empty() && !state.is_empty() => {
                Some(Self { code, state })
            }
            _ => None,
        })
    }
}

const CALLBACK_KEYS: [&str; 4] = ["code", "state", "error", "error_description"];

/// Remove the callback parameters from a URL, keeping everything else
///
/// A reload of the cleaned URL must not redeem the same code twice.
pub fn strip_callback_params(href: &str) -> Result<String> {
    let mut url = Url::parse(href)?;

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !CALLBACK_KEYS.contains(&key.as_ref()))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }

    Ok(url.to_string())
}

/// Loopback listener receiving the provider redirect on native hosts
pub struct CallbackServer {
    listener: TcpListener,
    addr: SocketAddr,
}

impl CallbackServer {
    /// Listen on a random loopback port
    pub fn new() -> Result<Self> {
        Self::bind("127.0.0.1:0")
    }

    /// Listen on a fixed address, e.g. the port registered as redirect URI
    pub fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        Ok(Self { listener, addr })
    }

    pub fn redirect_uri(&self) -> String {
        format!("http://{}/callback", self.addr)
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Wait for the redirect carrying `code` and `state`
    ///
    /// Requests for other paths are answered with 404 and ignored.
    pub fn wait_for_callback(&self, timeout: Duration) -> Result<CallbackParams> {
        let deadline = Instant::now() + timeout;

        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    let remaining = deadline
                        .saturating_duration_since(Instant::now())
                        .max(Duration::from_millis(1));
                    if let Some(params) = self.handle_request(stream, remaining)? {
                        return Ok(params);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(AuthError::NetworkTimeout {
                            url: self.redirect_uri(),
                        });
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn handle_request(
        &self,
        stream: TcpStream,
        read_timeout: Duration,
    ) -> Result<Option<CallbackParams>> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(read_timeout))?;
        let mut reader = BufReader::new(stream.try_clone()?);
        let mut request_line = String::new();
        match reader.read_line(&mut request_line) {
            Ok(_) => {}
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err(AuthError::NetworkTimeout {
                    url: self.redirect_uri(),
                });
            }
            Err(e) => return Err(e.into()),
        }

        // GET /callback?code=...&state=... HTTP/1.1
        let target = match request_line.split_whitespace().nth(1) {
            Some(target) => target,
            None => {
                respond(stream, "400 Bad Request", "Invalid request")?;
                return Ok(None);
            }
        };
        if !target.starts_with("/callback") {
            respond(stream, "404 Not Found", "Not found")?;
            return Ok(None);
        }

        match CallbackParams::from_url(&format!("http://{}{}", self.addr, target)) {
            Ok(Some(params)) => {
                respond(
                    stream,
                    "200 OK",
                    "Signed in with Kick. You can close this window.",
                )?;
                Ok(Some(params))
            }
            Ok(None) => {
                respond(stream, "400 Bad Request", "Missing code or state")?;
                Ok(None)
            }
            Err(e) => {
                respond(stream, "400 Bad Request", &e.to_string())?;
                Err(e)
            }
        }
    }
}

fn respond(mut stream: TcpStream, status: &str, message: &str) -> Result<()> {
    let html = format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>Kick sign-in</title></head>\
         <body><p>{}</p></body></html>",
        message
            .replace('&', "&amp;")
            .replace('<', "&lt;")
            .replace('>', "&gt;")
    );

    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        html.len(),
        html
    );

    stream.write_all(response.as_bytes())?;
    stream.flush()?;
    Ok(())
}

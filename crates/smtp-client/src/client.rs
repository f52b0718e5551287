use crate::client_types::{Response, ResponseBuilder, ResponseLine, SmtpClientTimeouts};
use crate::tls::TlsOptions;
use crate::traits::{AsyncReadAndWrite, BoxedAsyncReadAndWrite};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;

const MAX_LINE_LEN: usize = 4096;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("response is not UTF8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("Malformed Response: {0}")]
    MalformedResponseLine(String),
    #[error("Response line is too long")]
    ResponseTooLong,
    #[error("Not connected")]
    NotConnected,
    #[error("Command rejected {0:?}")]
    Rejected(Response),
    #[error("STARTTLS: {0} is not a valid DNS name")]
    InvalidDnsName(String),
    #[error("Timed Out waiting {duration:?} for response to {command:?}")]
    TimeOutResponse {
        command: Option<Command>,
        duration: Duration,
    },
    #[error("Timed Out writing {duration:?} {command:?}")]
    TimeOutRequest {
        command: Command,
        duration: Duration,
    },
    #[error("Error {error} reading response to {command:?}")]
    ReadError {
        command: Option<Command>,
        error: String,
        partial: String,
    },
    #[error("Error {error} writing {command:?}")]
    WriteError { command: Command, error: String },
    #[error("Timed Out sending message payload data")]
    TimeOutData,
    #[error("Error {error} sending message payload data")]
    DataWriteError { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ehlo(String),
    Helo(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    DataDot,
    Rset,
    StartTls,
    Quit,
}

impl Command {
    pub fn encode(&self) -> String {
        match self {
            Self::Ehlo(domain) => format!("EHLO {domain}\r\n"),
            Self::Helo(domain) => format!("HELO {domain}\r\n"),
            Self::MailFrom(address) => format!("MAIL FROM:<{address}>\r\n"),
            Self::RcptTo(address) => format!("RCPT TO:<{address}>\r\n"),
            Self::Data => "DATA\r\n".to_string(),
            Self::DataDot => ".\r\n".to_string(),
            Self::Rset => "RSET\r\n".to_string(),
            Self::StartTls => "STARTTLS\r\n".to_string(),
            Self::Quit => "QUIT\r\n".to_string(),
        }
    }

    pub fn client_timeout(&self, timeouts: &SmtpClientTimeouts) -> Duration {
        match self {
            Self::Ehlo(_) | Self::Helo(_) => timeouts.ehlo_timeout,
            Self::MailFrom(_) => timeouts.mail_from_timeout,
            Self::RcptTo(_) => timeouts.rcpt_to_timeout,
            Self::Data => timeouts.data_timeout,
            Self::DataDot => timeouts.data_dot_timeout,
            Self::StartTls => timeouts.starttls_timeout,
            Self::Rset | Self::Quit => timeouts.idle_timeout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsmtpCapability {
    pub name: String,
    pub param: Option<String>,
}

#[derive(Debug)]
pub struct SmtpClient {
    socket: Option<BoxedAsyncReadAndWrite>,
    hostname: String,
    capabilities: HashMap<String, EsmtpCapability>,
    read_buffer: Vec<u8>,
    timeouts: SmtpClientTimeouts,
}

fn extract_hostname(hostname: &str) -> &str {
    // Just the hostname, without any :port
    let fields: Vec<&str> = hostname.rsplitn(2, ':').collect();
    let hostname = if fields.len() == 2 {
        fields[1]
    } else {
        hostname
    };

    let hostname = if hostname.starts_with('[') && hostname.ends_with(']') {
        &hostname[1..hostname.len() - 1]
    } else {
        hostname
    };

    // Remove any trailing FQDN dot
    hostname.strip_suffix('.').unwrap_or(hostname)
}

impl SmtpClient {
    pub async fn new<A: ToSocketAddrs + ToString + Clone>(
        addr: A,
        timeouts: SmtpClientTimeouts,
    ) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr.clone()).await?;
        // No need for Nagle with SMTP request/response
        stream.set_nodelay(true)?;
        Ok(Self::with_stream(stream, addr.to_string(), timeouts))
    }

    pub fn with_stream<S: AsyncReadAndWrite + 'static, H: AsRef<str>>(
        stream: S,
        peer_hostname: H,
        timeouts: SmtpClientTimeouts,
    ) -> Self {
        let hostname = extract_hostname(peer_hostname.as_ref()).to_string();

        Self {
            socket: Some(Box::new(stream)),
            hostname,
            capabilities: HashMap::new(),
            read_buffer: Vec::with_capacity(1024),
            timeouts,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    pub fn timeouts(&self) -> &SmtpClientTimeouts {
        &self.timeouts
    }

    pub fn has_esmtp_capability(&self, name: &str) -> bool {
        self.capabilities.contains_key(&name.to_ascii_uppercase())
    }

    async fn read_line(
        &mut self,
        timeout_duration: Duration,
        cmd: Option<&Command>,
    ) -> Result<String, ClientError> {
        let mut too_long = false;
        loop {
            let mut iter = self.read_buffer.iter().enumerate();
            while let Some((i, &b)) = iter.next() {
                if b != b'\r' {
                    continue;
                }
                if let Some((_, b'\n')) = iter.next() {
                    if too_long {
                        self.read_buffer.drain(0..i + 2);
                        return Err(ClientError::ResponseTooLong);
                    }

                    let line = String::from_utf8(self.read_buffer[0..i].to_vec());
                    self.read_buffer.drain(0..i + 2);
                    return Ok(line?);
                }
            }
            if self.read_buffer.len() > MAX_LINE_LEN {
                self.read_buffer.clear();
                too_long = true;
            }

            // Didn't find a complete line, fill up the rest of the buffer
            let mut data = [0u8; MAX_LINE_LEN];
            let size = match self.socket.as_mut() {
                Some(s) => match timeout(timeout_duration, s.read(&mut data)).await {
                    Ok(Ok(size)) => size,
                    Ok(Err(err)) => {
                        self.socket.take();
                        return Err(ClientError::ReadError {
                            command: cmd.cloned(),
                            error: format!("{err:#}"),
                            partial: String::from_utf8_lossy(&self.read_buffer).to_string(),
                        });
                    }
                    Err(_) => {
                        self.socket.take();
                        return Err(ClientError::TimeOutResponse {
                            command: cmd.cloned(),
                            duration: timeout_duration,
                        });
                    }
                },
                None => {
                    return Err(ClientError::ReadError {
                        command: cmd.cloned(),
                        error: "the socket was closed in response to an earlier issue".to_string(),
                        partial: String::from_utf8_lossy(&self.read_buffer).to_string(),
                    });
                }
            };
            if size == 0 {
                self.socket.take();
                return Err(ClientError::ReadError {
                    command: cmd.cloned(),
                    error: "Connection closed by peer".to_string(),
                    partial: String::from_utf8_lossy(&self.read_buffer).to_string(),
                });
            }
            self.read_buffer.extend_from_slice(&data[0..size]);
        }
    }

    pub async fn read_response(
        &mut self,
        command: Option<&Command>,
        timeout_duration: Duration,
    ) -> Result<Response, ClientError> {
        let mut line = self.read_line(timeout_duration, command).await?;
        tracing::trace!("recv<-{}: {line}", self.hostname);
        let mut parsed = parse_response_line(&line)?;
        let mut builder = ResponseBuilder::new(&parsed);

        while !parsed.is_final {
            line = self.read_line(timeout_duration, command).await?;
            tracing::trace!("recv<-{}: {line}", self.hostname);
            parsed = parse_response_line(&line)?;
            builder
                .add_line(&parsed)
                .map_err(ClientError::MalformedResponseLine)?;
        }

        Ok(builder.build(command.map(|cmd| cmd.encode())))
    }

    async fn write_command_request(&mut self, command: &Command) -> Result<(), ClientError> {
        let line = command.encode();
        tracing::trace!("send->{}: {}", self.hostname, line.escape_debug());
        let duration = command.client_timeout(&self.timeouts);
        match self.socket.as_mut() {
            Some(socket) => {
                match timeout(duration, async {
                    socket.write_all(line.as_bytes()).await?;
                    socket.flush().await
                })
                .await
                {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(err)) => {
                        self.socket.take();
                        Err(ClientError::WriteError {
                            command: command.clone(),
                            error: format!("{err:#}"),
                        })
                    }
                    Err(_) => {
                        self.socket.take();
                        Err(ClientError::TimeOutRequest {
                            command: command.clone(),
                            duration,
                        })
                    }
                }
            }
            None => Err(ClientError::NotConnected),
        }
    }

    async fn write_data_with_timeout(&mut self, data: &[u8]) -> Result<(), ClientError> {
        let duration = self.timeouts.data_timeout;
        match self.socket.as_mut() {
            Some(socket) => {
                match timeout(duration, async {
                    socket.write_all(data).await?;
                    socket.flush().await
                })
                .await
                {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(err)) => {
                        self.socket.take();
                        Err(ClientError::DataWriteError {
                            error: format!("{err:#}"),
                        })
                    }
                    Err(_) => {
                        self.socket.take();
                        Err(ClientError::TimeOutData)
                    }
                }
            }
            None => Err(ClientError::NotConnected),
        }
    }

    pub async fn send_command(&mut self, command: &Command) -> Result<Response, ClientError> {
        self.write_command_request(command).await?;
        self.read_response(Some(command), command.client_timeout(&self.timeouts))
            .await
    }

    pub async fn ehlo(
        &mut self,
        ehlo_name: &str,
    ) -> Result<&HashMap<String, EsmtpCapability>, ClientError> {
        let response = self
            .send_command(&Command::Ehlo(ehlo_name.to_string()))
            .await?;
        if response.code != 250 {
            return Err(ClientError::Rejected(response));
        }

        let mut capabilities = HashMap::new();

        for line in response.content.lines().skip(1) {
            let mut fields = line.splitn(2, ' ');
            if let Some(name) = fields.next() {
                let param = fields.next().map(|s| s.to_string());
                let cap = EsmtpCapability {
                    name: name.to_string(),
                    param,
                };
                capabilities.insert(name.to_ascii_uppercase(), cap);
            }
        }

        self.capabilities = capabilities;
        Ok(&self.capabilities)
    }

    /// Attempt a STARTTLS upgrade. A rejected STARTTLS command or an IO
    /// failure is an `Err`; a completed exchange reports the handshake
    /// outcome in the returned status.
    pub async fn starttls(&mut self, options: TlsOptions) -> Result<TlsStatus, ClientError> {
        let resp = self.send_command(&Command::StartTls).await?;
        if resp.code != 220 {
            return Err(ClientError::Rejected(resp));
        }

        let connector = options.build_tls_connector();
        let server_name = match IpAddr::from_str(self.hostname.as_str()) {
            Ok(ip) => ServerName::IpAddress(ip.into()),
            Err(_) => ServerName::try_from(self.hostname.clone())
                .map_err(|_| ClientError::InvalidDnsName(self.hostname.clone()))?,
        };

        match connector
            .connect(
                server_name,
                match self.socket.take() {
                    Some(s) => s,
                    None => return Err(ClientError::NotConnected),
                },
            )
            .into_fallible()
            .await
        {
            Ok(stream) => {
                let mut tls_info = TlsInformation::default();
                let (_, conn) = stream.get_ref();
                tls_info.cipher = match conn.negotiated_cipher_suite() {
                    Some(suite) => suite.suite().as_str().unwrap_or("UNKNOWN").to_string(),
                    None => String::new(),
                };
                tls_info.protocol_version = match conn.protocol_version() {
                    Some(version) => version.as_str().unwrap_or("UNKNOWN").to_string(),
                    None => String::new(),
                };

                self.socket.replace(Box::new(stream));
                Ok(TlsStatus::Info(tls_info))
            }
            Err((err, stream)) => {
                self.socket.replace(stream);
                Ok(TlsStatus::FailedHandshake(format!("{err:#}")))
            }
        }
    }

    /// Send one message: MAIL FROM, one RCPT TO per recipient, then the
    /// dot-stuffed payload. Any non-success reply surfaces as
    /// `ClientError::Rejected`.
    pub async fn send_mail<B: AsRef<[u8]>>(
        &mut self,
        sender: &str,
        recipients: &[String],
        data: B,
    ) -> Result<Response, ClientError> {
        let data: &[u8] = data.as_ref();
        let stuffed;

        let data = match apply_dot_stuffing(data) {
            Some(d) => {
                stuffed = d;
                &stuffed
            }
            None => data,
        };

        let mail_resp = self
            .send_command(&Command::MailFrom(sender.to_string()))
            .await?;
        if mail_resp.code != 250 {
            return Err(ClientError::Rejected(mail_resp));
        }

        for recipient in recipients {
            let rcpt_resp = self
                .send_command(&Command::RcptTo(recipient.to_string()))
                .await?;
            if rcpt_resp.code != 250 {
                return Err(ClientError::Rejected(rcpt_resp));
            }
        }

        let data_resp = self.send_command(&Command::Data).await?;
        if data_resp.code != 354 {
            return Err(ClientError::Rejected(data_resp));
        }

        let needs_newline = data.last().map(|&b| b != b'\n').unwrap_or(true);

        tracing::trace!("message data is {} bytes", data.len());

        self.write_data_with_timeout(data).await?;

        let marker = if needs_newline { "\r\n.\r\n" } else { ".\r\n" };

        tracing::trace!("send->{}: {}", self.hostname, marker.escape_debug());

        self.write_data_with_timeout(marker.as_bytes()).await?;

        let data_dot = Command::DataDot;
        let resp = self
            .read_response(Some(&data_dot), data_dot.client_timeout(&self.timeouts))
            .await?;
        if resp.code != 250 {
            return Err(ClientError::Rejected(resp));
        }

        Ok(resp)
    }

    /// End the conversation. Used at the end of a batch; the connection
    /// is unusable afterwards.
    pub async fn quit(&mut self) -> Result<Response, ClientError> {
        let resp = self.send_command(&Command::Quit).await;
        self.socket.take();
        resp
    }
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone)]
pub enum TlsStatus {
    FailedHandshake(String),
    Info(TlsInformation),
}

#[derive(Debug, Default, PartialEq, Eq, Serialize, Deserialize, Clone)]
pub struct TlsInformation {
    pub cipher: String,
    pub protocol_version: String,
}

fn parse_response_line(line: &str) -> Result<ResponseLine, ClientError> {
    if line.len() < 4 {
        return Err(ClientError::MalformedResponseLine(line.to_string()));
    }

    match line.as_bytes()[3] {
        b' ' | b'-' => match line[0..3].parse::<u16>() {
            Ok(code) => Ok(ResponseLine {
                code,
                is_final: line.as_bytes()[3] == b' ',
                content: &line[4..],
            }),
            Err(_) => Err(ClientError::MalformedResponseLine(line.to_string())),
        },
        _ => Err(ClientError::MalformedResponseLine(line.to_string())),
    }
}

fn apply_dot_stuffing(data: &[u8]) -> Option<Vec<u8>> {
    fn find_lfdot(data: &[u8], from: usize) -> Option<usize> {
        data[from..]
            .windows(2)
            .position(|w| w == b"\n.")
            .map(|i| from + i)
    }

    if !data.starts_with(b".") && find_lfdot(data, 0).is_none() {
        return None;
    }

    let mut stuffed = vec![];
    if data.starts_with(b".") {
        stuffed.push(b'.');
    }
    let mut last_idx = 0;
    let mut search = 0;
    while let Some(i) = find_lfdot(data, search) {
        stuffed.extend_from_slice(&data[last_idx..=i]);
        stuffed.push(b'.');
        last_idx = i + 1;
        search = i + 1;
    }
    stuffed.extend_from_slice(&data[last_idx..]);
    Some(stuffed)
}

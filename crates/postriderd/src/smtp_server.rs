use crate::context::{Daemon, Submission};
use std::fmt::Debug;
use std::sync::Arc;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf,
    WriteHalf,
};
use tokio::net::TcpListener;

/// Accept loop for the submission socket. One task per conversation;
/// trusted local clients only, so there is no AUTH and no TLS here.
pub async fn serve(ctx: Arc<Daemon>, listener: TcpListener) -> anyhow::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            tracing::debug!("submission connection from {peer}");
            if let Err(err) = SmtpServer::run(socket, ctx).await {
                tracing::debug!("submission connection from {peer} ended: {err:#}");
            }
        });
    }
}

#[derive(Debug)]
struct TransactionState {
    sender: EnvelopeAddress,
    recipients: Vec<EnvelopeAddress>,
}

pub struct SmtpServer<T> {
    reader: BufReader<ReadHalf<T>>,
    writer: BufWriter<WriteHalf<T>>,
    state: Option<TransactionState>,
    ctx: Arc<Daemon>,
}

impl<T: AsyncRead + AsyncWrite> SmtpServer<T> {
    pub async fn run(socket: T, ctx: Arc<Daemon>) -> anyhow::Result<()> {
        let (reader, writer) = tokio::io::split(socket);
        let mut server = SmtpServer {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
            state: None,
            ctx,
        };
        server.process().await
    }

    async fn write_response<S: AsRef<str>>(
        &mut self,
        status: u16,
        message: S,
    ) -> anyhow::Result<()> {
        let mut lines = message.as_ref().lines().peekable();
        while let Some(line) = lines.next() {
            let is_last = lines.peek().is_none();
            let sep = if is_last { ' ' } else { '-' };
            let text = format!("{status}{sep}{line}\r\n");
            self.writer.write_all(text.as_bytes()).await?;
        }
        self.writer.flush().await?;
        Ok(())
    }

    async fn read_line(&mut self) -> anyhow::Result<String> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            anyhow::bail!("connection closed by peer");
        }
        Ok(line)
    }

    async fn process(&mut self) -> anyhow::Result<()> {
        let greeting = format!("{} ESMTP ready", self.ctx.localname);
        self.write_response(220, greeting).await?;

        loop {
            let line = self.read_line().await?;
            let line = line.trim_end();

            match Command::parse(line) {
                Err(err) => {
                    self.write_response(
                        501,
                        format!("Syntax error in command or arguments: {err}"),
                    )
                    .await?;
                }
                Ok(Command::Quit) => {
                    self.write_response(221, "Bye").await?;
                    return Ok(());
                }
                Ok(Command::Ehlo(domain)) => {
                    self.write_response(250, format!("8BITMIME\nHello {domain}"))
                        .await?;
                }
                Ok(Command::Helo(domain)) => {
                    self.write_response(250, format!("Hello {domain}")).await?;
                }
                Ok(Command::Mail(address)) => {
                    if self.state.is_some() {
                        self.write_response(503, "MAIL FROM already issued; you must RSET first")
                            .await?;
                        continue;
                    }
                    self.write_response(250, "OK").await?;
                    self.state.replace(TransactionState {
                        sender: address,
                        recipients: vec![],
                    });
                }
                Ok(Command::Rcpt(address)) => {
                    if self.state.is_none() {
                        self.write_response(503, "MAIL FROM must be issued first")
                            .await?;
                        continue;
                    }
                    self.write_response(250, "OK").await?;
                    self.state
                        .as_mut()
                        .expect("checked state above")
                        .recipients
                        .push(address);
                }
                Ok(Command::Data) => {
                    let ready = self
                        .state
                        .as_ref()
                        .map(|state| !state.recipients.is_empty())
                        .unwrap_or(false);
                    if !ready {
                        self.write_response(503, "RCPT TO must be issued first")
                            .await?;
                        continue;
                    }

                    self.write_response(354, "Send body; end with CRLF.CRLF")
                        .await?;
                    let data = self.read_data().await?;

                    let state = self.state.take().expect("checked state above");
                    let msg = Submission {
                        from: state.sender.to_string(),
                        to: state
                            .recipients
                            .iter()
                            .map(EnvelopeAddress::to_string)
                            .collect(),
                        data,
                    };
                    self.ctx.submit(&msg);

                    self.write_response(250, "OK, queued").await?;
                }
                Ok(Command::Rset) => {
                    self.state.take();
                    self.write_response(250, "Reset state").await?;
                }
                Ok(Command::Noop) => {
                    self.write_response(250, "OK").await?;
                }
                Ok(Command::Unknown(cmd)) => {
                    self.write_response(500, format!("Unknown command: {cmd}"))
                        .await?;
                }
            }
        }
    }

    /// Read the message body up to the lone-dot terminator, undoing
    /// transparency stuffing. Bytes are kept as received.
    async fn read_data(&mut self) -> anyhow::Result<Vec<u8>> {
        let mut data = vec![];

        loop {
            let mut line = Vec::new();
            if self.reader.read_until(b'\n', &mut line).await? == 0 {
                anyhow::bail!("connection closed during DATA");
            }

            if line == b".\r\n" || line == b".\n" {
                return Ok(data);
            }

            let line = if line.starts_with(b".") {
                &line[1..]
            } else {
                &line[..]
            };

            data.extend_from_slice(line);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeAddress {
    user: String,
    domain: String,
}

impl EnvelopeAddress {
    fn parse(text: &str) -> anyhow::Result<Self> {
        let fields: Vec<&str> = text.split('@').collect();
        anyhow::ensure!(
            fields.len() == 2 && !fields[0].is_empty() && !fields[1].is_empty(),
            "expected user@domain"
        );
        Ok(Self {
            user: fields[0].to_string(),
            domain: fields[1].to_string(),
        })
    }
}

impl std::fmt::Display for EnvelopeAddress {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{}@{}", self.user, self.domain)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Ehlo(String),
    Helo(String),
    Mail(EnvelopeAddress),
    Rcpt(EnvelopeAddress),
    Data,
    Rset,
    Noop,
    Quit,
    Unknown(String),
}

impl Command {
    fn parse(line: &str) -> anyhow::Result<Self> {
        fn prefix_match(line: &str, candidate: &str) -> bool {
            if line.len() < candidate.len() {
                false
            } else {
                line[..candidate.len()].eq_ignore_ascii_case(candidate)
            }
        }

        fn extract_envelope(line: &str) -> anyhow::Result<&str> {
            let line = line.trim_start();
            if !line.starts_with('<') {
                anyhow::bail!("expected <: {line:?}");
            }
            let rangle = line
                .bytes()
                .position(|c| c == b'>')
                .ok_or_else(|| anyhow::anyhow!("expected >: {line:?}"))?;

            Ok(&line[1..rangle])
        }

        Ok(if line.eq_ignore_ascii_case("QUIT") {
            Self::Quit
        } else if line.eq_ignore_ascii_case("DATA") {
            Self::Data
        } else if line.eq_ignore_ascii_case("RSET") {
            Self::Rset
        } else if line.eq_ignore_ascii_case("NOOP") {
            Self::Noop
        } else if prefix_match(line, "EHLO ") {
            Self::Ehlo(line[5..].to_string())
        } else if prefix_match(line, "HELO ") {
            Self::Helo(line[5..].to_string())
        } else if prefix_match(line, "MAIL FROM:") {
            let address = extract_envelope(&line[10..])?;
            Self::Mail(EnvelopeAddress::parse(address)?)
        } else if prefix_match(line, "RCPT TO:") {
            let address = extract_envelope(&line[8..])?;
            Self::Rcpt(EnvelopeAddress::parse(address)?)
        } else {
            Self::Unknown(line.to_string())
        })
    }
}

//! `outbox` - submit a plain-text message through an SMTP relay.
//!
//! ```text
//! outbox [--uri URI] --from ADDR --to ADDR [--cc ADDR] [--bcc ADDR]
//!        [--subject TEXT] [--attach PATH] < body.txt
//! ```
//!
//! The descriptor may also come from `OUTBOX_SMTP_URI`.

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use outbox_smtp::{
    Address, Attachment, Config, Mailbox, OutgoingMessage, SmtpTransport, Transport,
};
use tokio::io::AsyncReadExt;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const URI_ENV: &str = "OUTBOX_SMTP_URI";

const USAGE: &str = "usage: outbox [--uri URI] --from ADDR --to ADDR [--cc ADDR] [--bcc ADDR] \
                     [--subject TEXT] [--attach PATH] < body";

/// Parsed command line.
#[derive(Debug, Default)]
struct Args {
    uri: Option<String>,
    from: Option<String>,
    to: Vec<String>,
    cc: Vec<String>,
    bcc: Vec<String>,
    subject: String,
    attachments: Vec<String>,
}

impl Args {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Self> {
        let mut parsed = Self::default();
        while let Some(flag) = args.next() {
            let mut value = || {
                args.next()
                    .with_context(|| format!("{flag} needs a value\n{USAGE}"))
            };
            match flag.as_str() {
                "--uri" => parsed.uri = Some(value()?),
                "--from" => parsed.from = Some(value()?),
                "--to" => parsed.to.push(value()?),
                "--cc" => parsed.cc.push(value()?),
                "--bcc" => parsed.bcc.push(value()?),
                "--subject" => parsed.subject = value()?,
                "--attach" => parsed.attachments.push(value()?),
                _ => bail!("unknown argument {flag}\n{USAGE}"),
            }
        }
        Ok(parsed)
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "outbox=info,outbox_smtp=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse(std::env::args().skip(1))?;

    let uri = match args.uri.clone() {
        Some(uri) => uri,
        None => std::env::var(URI_ENV)
            .with_context(|| format!("no --uri given and {URI_ENV} is not set"))?,
    };
    let config = Config::from_uri(&uri).context("invalid connection descriptor")?;

    let mut message = build_message(&args).await?;

    info!(
        "Submitting to {}:{}",
        config.settings.host, config.settings.port
    );
    let mut transport = SmtpTransport::new(config);
    match transport.send_message(&mut message).await {
        Ok(()) => {
            info!("Message sent");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("{e}");
            if e.permanent_failure {
                eprintln!("The server may have accepted the message; not safe to resend.");
                Ok(ExitCode::from(2))
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
    }
}

async fn build_message(args: &Args) -> Result<OutgoingMessage> {
    let from = args.from.as_deref().context("--from is required")?;
    if args.to.is_empty() && args.cc.is_empty() && args.bcc.is_empty() {
        bail!("at least one recipient is required\n{USAGE}");
    }

    let mut body = String::new();
    tokio::io::stdin()
        .read_to_string(&mut body)
        .await
        .context("reading body from stdin")?;

    let mut message = OutgoingMessage::new(Mailbox::new(from)?, args.subject.clone(), body);
    for to in &args.to {
        message = message.to(Address::new(to.as_str())?);
    }
    for cc in &args.cc {
        message = message.cc(Address::new(cc.as_str())?);
    }
    for bcc in &args.bcc {
        message = message.bcc(Address::new(bcc.as_str())?);
    }
    for path in &args.attachments {
        message = message.attach(read_attachment(Path::new(path)).await?);
    }
    Ok(message)
}

async fn read_attachment(path: &Path) -> Result<Attachment> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading attachment {}", path.display()))?;
    let filename = path
        .file_name()
        .map_or_else(|| "attachment".to_string(), |n| n.to_string_lossy().into_owned());
    Ok(Attachment::new(filename, "application/octet-stream", data))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Args> {
        Args::parse(args.iter().map(ToString::to_string))
    }

    #[test]
    fn test_parse_args() {
        let args = parse(&[
            "--uri",
            "smtp://mail.example.com",
            "--from",
            "a@example.com",
            "--to",
            "b@example.com",
            "--to",
            "c@example.com",
            "--bcc",
            "d@example.com",
            "--subject",
            "hello",
        ])
        .unwrap();
        assert_eq!(args.uri.as_deref(), Some("smtp://mail.example.com"));
        assert_eq!(args.to, vec!["b@example.com", "c@example.com"]);
        assert_eq!(args.bcc, vec!["d@example.com"]);
        assert_eq!(args.subject, "hello");
    }

    #[test]
    fn test_parse_rejects_unknown_and_missing_values() {
        assert!(parse(&["--nope"]).is_err());
        assert!(parse(&["--to"]).is_err());
    }
}

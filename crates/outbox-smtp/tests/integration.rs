//! Integration tests for the SMTP transport.
//!
//! These tests run the transport against a scripted SMTP server on a
//! loopback socket and inspect what the server received.

#![allow(clippy::unwrap_used)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;

use outbox_smtp::{
    Address, Attachment, AuthType, Config, ConnectionSecurity, Error, Mailbox, OutgoingMessage,
    ServerSettings, SmtpTransport, Transport, TrustAuthority,
};

const EHLO_8BIT: &str = "250-test.example.com\r\n250-8BITMIME\r\n250 SIZE 35882577\r\n";

/// How the scripted server answers.
#[derive(Clone)]
struct Script {
    ehlo: &'static str,
    /// EHLO reply once the session is encrypted.
    ehlo_tls: &'static str,
    helo: &'static str,
    starttls: &'static str,
    auth: &'static str,
    end_of_data: &'static str,
    /// Certificate to serve; without one a STARTTLS client is left hanging.
    tls: Option<TlsAcceptor>,
    implicit_tls: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            ehlo: EHLO_8BIT,
            ehlo_tls: EHLO_8BIT,
            helo: "250 test.example.com\r\n",
            starttls: "220 2.0.0 Ready to start TLS\r\n",
            auth: "235 2.7.0 Authentication successful\r\n",
            end_of_data: "250 2.0.0 Ok: queued\r\n",
            tls: None,
            implicit_tls: false,
        }
    }
}

impl Script {
    fn reply(&self, line: &str, secure: bool) -> &'static str {
        let upper = line.to_ascii_uppercase();
        if upper.starts_with("EHLO") {
            if secure { self.ehlo_tls } else { self.ehlo }
        } else if upper.starts_with("HELO") {
            self.helo
        } else if upper == "STARTTLS" {
            self.starttls
        } else if upper.starts_with("AUTH") {
            self.auth
        } else if upper.starts_with("MAIL FROM") {
            "250 2.1.0 Ok\r\n"
        } else if upper.starts_with("RCPT TO") {
            if line.contains("unknown@") {
                "550 5.1.1 No such user\r\n"
            } else {
                "250 2.1.5 Ok\r\n"
            }
        } else if upper == "DATA" {
            "354 End data with <CR><LF>.<CR><LF>\r\n"
        } else if upper == "QUIT" {
            "221 2.0.0 Bye\r\n"
        } else {
            "502 5.5.2 Command not recognized\r\n"
        }
    }
}

/// Self-signed certificate for `localhost`.
struct TestCertificate {
    acceptor: TlsAcceptor,
    trust: Arc<PinnedTrust>,
}

impl TestCertificate {
    fn generate() -> Self {
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert = CertificateDer::from(generated.serialize_der().unwrap());
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            generated.serialize_private_key_der(),
        ));

        let server = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert.clone()], key)
            .unwrap();

        let mut roots = RootCertStore::empty();
        roots.add(cert).unwrap();
        let client = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Self {
            acceptor: TlsAcceptor::from(Arc::new(server)),
            trust: Arc::new(PinnedTrust(Arc::new(client))),
        }
    }
}

/// Trusts only the test certificate.
#[derive(Debug)]
struct PinnedTrust(Arc<ClientConfig>);

impl TrustAuthority for PinnedTrust {
    fn client_config(&self, _host: &str, _port: u16) -> outbox_smtp::Result<Arc<ClientConfig>> {
        Ok(Arc::clone(&self.0))
    }
}

/// What the server saw.
#[derive(Debug, Default)]
struct Transcript {
    commands: Vec<String>,
    bodies: Vec<String>,
    sessions: usize,
    tls_sessions: usize,
}

struct ScriptedServer {
    port: u16,
    transcript: Arc<Mutex<Transcript>>,
}

impl ScriptedServer {
    async fn start(script: Script) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let transcript = Arc::new(Mutex::new(Transcript::default()));

        let shared = Arc::clone(&transcript);
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                shared.lock().unwrap().sessions += 1;
                tokio::spawn(session(socket, script.clone(), Arc::clone(&shared)));
            }
        });

        Self { port, transcript }
    }

    fn settings(&self) -> ServerSettings {
        ServerSettings::new("127.0.0.1", ConnectionSecurity::None).with_port(self.port)
    }

    fn tls_settings(&self, security: ConnectionSecurity) -> ServerSettings {
        ServerSettings::new("localhost", security).with_port(self.port)
    }

    fn transport(&self, settings: ServerSettings) -> SmtpTransport {
        SmtpTransport::new(Self::config(settings, Duration::from_secs(5)).build())
    }

    fn tls_transport(&self, settings: ServerSettings, cert: &TestCertificate) -> SmtpTransport {
        let config = Self::config(settings, Duration::from_secs(5))
            .trust(cert.trust.clone())
            .build();
        SmtpTransport::new(config)
    }

    fn config(settings: ServerSettings, limit: Duration) -> outbox_smtp::ConfigBuilder {
        Config::builder(settings)
            .local_hostname("client.example.com")
            .connect_timeout(limit)
            .read_timeout(limit)
    }

    fn commands(&self) -> Vec<String> {
        self.transcript.lock().unwrap().commands.clone()
    }

    fn bodies(&self) -> Vec<String> {
        self.transcript.lock().unwrap().bodies.clone()
    }

    fn sessions(&self) -> usize {
        self.transcript.lock().unwrap().sessions
    }

    fn tls_sessions(&self) -> usize {
        self.transcript.lock().unwrap().tls_sessions
    }
}

async fn session(socket: TcpStream, script: Script, transcript: Arc<Mutex<Transcript>>) {
    if script.implicit_tls {
        if let Some(tls) = accept(socket, &script, &transcript).await {
            converse(tls, &script, &transcript, true, true).await;
        }
        return;
    }

    let Some(socket) = converse(socket, &script, &transcript, true, false).await else {
        return;
    };
    if let Some(tls) = accept(socket, &script, &transcript).await {
        converse(tls, &script, &transcript, false, true).await;
    }
}

async fn accept(
    socket: TcpStream,
    script: &Script,
    transcript: &Mutex<Transcript>,
) -> Option<TlsStream<TcpStream>> {
    let Some(acceptor) = &script.tls else {
        // Never answer the ClientHello.
        tokio::time::sleep(Duration::from_secs(60)).await;
        drop(socket);
        return None;
    };
    let tls = acceptor.accept(socket).await.ok()?;
    transcript.lock().unwrap().tls_sessions += 1;
    Some(tls)
}

/// Plays the script over one stream.
///
/// Returns the stream when the client is cleared to start TLS on it.
async fn converse<S>(
    stream: S,
    script: &Script,
    transcript: &Mutex<Transcript>,
    greet: bool,
    secure: bool,
) -> Option<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = BufReader::new(stream);
    if greet && !respond(&mut stream, "220 test.example.com ESMTP\r\n").await {
        return None;
    }

    let mut line = String::new();
    loop {
        line.clear();
        if stream.read_line(&mut line).await.unwrap_or(0) == 0 {
            return None;
        }
        let command = line.trim_end_matches(['\r', '\n']).to_string();
        transcript.lock().unwrap().commands.push(command.clone());

        let reply = script.reply(&command, secure);
        if !respond(&mut stream, reply).await {
            return None;
        }

        if !secure && command.eq_ignore_ascii_case("STARTTLS") && reply.starts_with("220") {
            return Some(stream.into_inner());
        }

        if reply.starts_with("354") {
            let mut body = String::new();
            loop {
                line.clear();
                if stream.read_line(&mut line).await.unwrap_or(0) == 0 {
                    return None;
                }
                if line == ".\r\n" {
                    break;
                }
                body.push_str(&line);
            }
            transcript.lock().unwrap().bodies.push(body);
            if !respond(&mut stream, script.end_of_data).await {
                return None;
            }
        }

        if command.eq_ignore_ascii_case("QUIT") {
            return None;
        }
    }
}

async fn respond<S: AsyncWrite + Unpin>(stream: &mut S, reply: &str) -> bool {
    stream.write_all(reply.as_bytes()).await.is_ok() && stream.flush().await.is_ok()
}

fn addr(s: &str) -> Address {
    Address::new(s).unwrap()
}

fn message() -> OutgoingMessage {
    OutgoingMessage::new(
        Mailbox::with_name("Alice", "alice@example.com").unwrap(),
        "Greetings",
        "Hello Bob,\n.\nsee you\n",
    )
    .to(addr("bob@example.com"))
    .cc(addr("carol@example.com"))
    .bcc(addr("dave@example.com"))
}

#[tokio::test]
async fn test_send_message_end_to_end() {
    let server = ScriptedServer::start(Script::default()).await;
    let mut transport = server.transport(server.settings());
    let mut message = message();

    transport.send_message(&mut message).await.unwrap();

    let commands = server.commands();
    assert_eq!(
        commands,
        vec![
            "EHLO client.example.com",
            "MAIL FROM:<alice@example.com> BODY=8BITMIME",
            "RCPT TO:<bob@example.com>",
            "RCPT TO:<carol@example.com>",
            "RCPT TO:<dave@example.com>",
            "DATA",
            "QUIT",
        ]
    );

    let bodies = server.bodies();
    assert_eq!(bodies.len(), 1);
    assert!(bodies[0].contains("To: bob@example.com\r\n"));
    assert!(bodies[0].ends_with("\r\nHello Bob,\r\n..\r\nsee you\r\n"));
    assert!(!bodies[0].contains("dave@example.com"));

    assert!(transport.server_info().eight_bit_allowed());
    assert_eq!(transport.server_info().max_message_size(), Some(35_882_577));
    assert!(!transport.is_open());
}

#[tokio::test]
async fn test_helo_fallback_sends_seven_bit() {
    let server = ScriptedServer::start(Script {
        ehlo: "502 5.5.2 Command not recognized\r\n",
        ..Script::default()
    })
    .await;
    let mut transport = server.transport(server.settings());
    let mut message = OutgoingMessage::new(
        Mailbox::new("alice@example.com").unwrap(),
        "Grüße",
        "Schöne Grüße\r\n",
    )
    .to(addr("bob@example.com"));

    transport.send_message(&mut message).await.unwrap();

    let commands = server.commands();
    assert_eq!(commands[0], "EHLO client.example.com");
    assert_eq!(commands[1], "HELO client.example.com");
    assert_eq!(commands[2], "MAIL FROM:<alice@example.com>");

    let body = &server.bodies()[0];
    assert!(body.is_ascii());
    assert!(body.contains("Content-Transfer-Encoding: base64\r\n"));
}

#[tokio::test]
async fn test_starttls_required_but_not_offered() {
    let server = ScriptedServer::start(Script::default()).await;
    let settings = ServerSettings::new("127.0.0.1", ConnectionSecurity::StartTlsRequired)
        .with_port(server.port);
    let mut transport = server.transport(settings);

    let err = transport.open().await.unwrap_err();
    assert!(matches!(err, Error::CertificateValidation(_)));
    assert!(!transport.is_open());
    assert!(!server.commands().iter().any(|c| c == "STARTTLS"));

    let err = transport.send_message(&mut message()).await.unwrap_err();
    assert!(!err.permanent_failure);
    assert!(matches!(err.source, Error::CertificateValidation(_)));
}

#[tokio::test]
async fn test_automatic_auth_refuses_cleartext_on_plain_channel() {
    let server = ScriptedServer::start(Script {
        ehlo: "250-test.example.com\r\n250 AUTH LOGIN PLAIN\r\n",
        ..Script::default()
    })
    .await;
    let settings = server
        .settings()
        .with_credentials("alice", "secret", AuthType::Automatic);
    let mut transport = server.transport(settings);

    let err = transport.open().await.unwrap_err();
    assert!(matches!(err, Error::InsecureAutoAuth));
    assert!(!server.commands().iter().any(|c| c.starts_with("AUTH")));
}

#[tokio::test]
async fn test_explicit_plain_auth() {
    let server = ScriptedServer::start(Script {
        ehlo: "250-test.example.com\r\n250 AUTH LOGIN PLAIN\r\n",
        ..Script::default()
    })
    .await;
    let settings = server
        .settings()
        .with_credentials("user", "pass", AuthType::Plain);
    let mut transport = server.transport(settings);

    transport.open().await.unwrap();
    assert!(transport.is_open());
    transport.close().await;

    let commands = server.commands();
    assert_eq!(commands[1], "AUTH PLAIN AHVzZXIAcGFzcw==");
    assert_eq!(commands.last().unwrap(), "QUIT");
}

#[tokio::test]
async fn test_rejected_credentials() {
    let server = ScriptedServer::start(Script {
        ehlo: "250-test.example.com\r\n250 AUTH PLAIN\r\n",
        auth: "535 5.7.8 Authentication credentials invalid\r\n",
        ..Script::default()
    })
    .await;
    let settings = server
        .settings()
        .with_credentials("user", "wrong", AuthType::Plain);
    let mut transport = server.transport(settings);

    let err = transport.send_message(&mut message()).await.unwrap_err();
    assert!(matches!(err.source, Error::AuthenticationFailed(_)));
    assert!(!err.permanent_failure);
}

#[tokio::test]
async fn test_recipient_rejected_is_not_possibly_sent() {
    let server = ScriptedServer::start(Script::default()).await;
    let mut transport = server.transport(server.settings());
    let mut message = OutgoingMessage::new(Mailbox::new("alice@example.com").unwrap(), "Hi", "Hi")
        .to(addr("unknown@example.com"));

    let err = transport.send_message(&mut message).await.unwrap_err();
    assert!(!err.permanent_failure);
    assert_eq!(err.source.reply_code(), Some(550));
    assert!(matches!(
        &err.source,
        Error::NegativeReply { text, .. } if text == "5.1.1 No such user"
    ));

    let commands = server.commands();
    assert!(!commands.iter().any(|c| c == "DATA"));
    assert_eq!(commands.last().unwrap(), "QUIT");
}

#[tokio::test]
async fn test_message_too_large_is_checked_before_mail_from() {
    let server = ScriptedServer::start(Script {
        ehlo: "250-test.example.com\r\n250-8BITMIME\r\n250 SIZE 1000\r\n",
        ..Script::default()
    })
    .await;
    let mut transport = server.transport(server.settings());
    let mut message = message().attach(Attachment::new(
        "big.bin",
        "application/octet-stream",
        vec![7u8; 2000],
    ));

    let err = transport.send_message(&mut message).await.unwrap_err();
    assert!(matches!(
        err.source,
        Error::MessageTooLarge { limit: 1000, .. }
    ));
    assert!(!err.permanent_failure);
    assert!(!server.commands().iter().any(|c| c.starts_with("MAIL FROM")));
}

#[tokio::test]
async fn test_size_limit_ignored_without_attachments() {
    let server = ScriptedServer::start(Script {
        ehlo: "250-test.example.com\r\n250 SIZE 10\r\n",
        ..Script::default()
    })
    .await;
    let mut transport = server.transport(server.settings());

    transport.send_message(&mut message()).await.unwrap();
}

#[tokio::test]
async fn test_transient_failure_after_terminator_is_possibly_sent() {
    let server = ScriptedServer::start(Script {
        end_of_data: "451 4.3.0 Try again later\r\n",
        ..Script::default()
    })
    .await;
    let mut transport = server.transport(server.settings());

    let err = transport.send_message(&mut message()).await.unwrap_err();
    assert!(err.permanent_failure);
    assert_eq!(err.source.reply_code(), Some(451));
}

#[tokio::test]
async fn test_permanent_rejection_after_terminator_overrides_possible_send() {
    let server = ScriptedServer::start(Script {
        end_of_data: "554 5.7.1 Message rejected\r\n",
        ..Script::default()
    })
    .await;
    let mut transport = server.transport(server.settings());

    let err = transport.send_message(&mut message()).await.unwrap_err();
    assert!(!err.permanent_failure);
    assert_eq!(err.source.reply_code(), Some(554));
    assert_eq!(server.commands().last().unwrap(), "QUIT");
}

#[tokio::test]
async fn test_carrier_recipients_get_their_own_session() {
    let server = ScriptedServer::start(Script::default()).await;
    let mut transport = server.transport(server.settings());
    let mut message = OutgoingMessage::new(Mailbox::new("alice@example.com").unwrap(), "Hi", "Hi\r\n")
        .to(addr("bob@example.com"))
        .to(addr("taro@docomo.ne.jp"))
        .cc(addr("carol@example.com"));

    transport.send_message(&mut message).await.unwrap();

    assert_eq!(server.sessions(), 2);
    let rcpts: Vec<String> = server
        .commands()
        .into_iter()
        .filter(|c| c.starts_with("RCPT TO"))
        .collect();
    assert_eq!(
        rcpts,
        vec![
            "RCPT TO:<bob@example.com>",
            "RCPT TO:<carol@example.com>",
            "RCPT TO:<taro@docomo.ne.jp>",
        ]
    );
    assert_eq!(message.charset(), "x-docomo-shift_jis-2007");
}

#[tokio::test]
async fn test_connect_failure_is_transient() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let settings = ServerSettings::new("127.0.0.1", ConnectionSecurity::None).with_port(port);
    let mut transport = SmtpTransport::new(Config::new(settings));

    let err = transport.send_message(&mut message()).await.unwrap_err();
    assert!(matches!(err.source, Error::ConnectFailed { .. }));
    assert!(err.source.is_transient());
    assert!(!err.permanent_failure);
}

#[tokio::test]
async fn test_starttls_upgrade_renegotiates_extensions() {
    let cert = TestCertificate::generate();
    let server = ScriptedServer::start(Script {
        ehlo: "250-test.example.com\r\n250-STARTTLS\r\n250 SIZE 1000\r\n",
        ehlo_tls: "250-test.example.com\r\n250-8BITMIME\r\n250 AUTH LOGIN PLAIN\r\n",
        tls: Some(cert.acceptor.clone()),
        ..Script::default()
    })
    .await;
    let settings = server
        .tls_settings(ConnectionSecurity::StartTlsRequired)
        .with_credentials("alice", "secret", AuthType::Automatic);
    let mut transport = server.tls_transport(settings, &cert);

    transport.open().await.unwrap();
    let info = transport.server_info();
    assert!(info.secure);
    assert!(info.eight_bit_allowed());
    assert!(!info.extensions.supports_starttls());
    assert_eq!(info.max_message_size(), None);
    transport.close().await;

    assert_eq!(server.tls_sessions(), 1);
    assert_eq!(
        server.commands(),
        vec![
            "EHLO client.example.com",
            "STARTTLS",
            "EHLO client.example.com",
            "AUTH PLAIN AGFsaWNlAHNlY3JldA==",
            "QUIT",
        ]
    );
}

#[tokio::test]
async fn test_implicit_tls_end_to_end() {
    let cert = TestCertificate::generate();
    let server = ScriptedServer::start(Script {
        ehlo_tls: "250-test.example.com\r\n250-8BITMIME\r\n250 AUTH PLAIN\r\n",
        tls: Some(cert.acceptor.clone()),
        implicit_tls: true,
        ..Script::default()
    })
    .await;
    let settings = server
        .tls_settings(ConnectionSecurity::SslTlsRequired)
        .with_credentials("alice", "secret", AuthType::Automatic);
    let mut transport = server.tls_transport(settings, &cert);
    let mut message = message();

    transport.send_message(&mut message).await.unwrap();

    assert_eq!(server.tls_sessions(), 1);
    assert!(transport.server_info().secure);
    let commands = server.commands();
    assert_eq!(commands[0], "EHLO client.example.com");
    assert_eq!(commands[1], "AUTH PLAIN AGFsaWNlAHNlY3JldA==");
    assert_eq!(commands[2], "MAIL FROM:<alice@example.com> BODY=8BITMIME");
    assert!(!commands.iter().any(|c| c == "STARTTLS"));
    assert_eq!(server.bodies().len(), 1);
}

#[tokio::test]
async fn test_untrusted_certificate_is_rejected() {
    let served = TestCertificate::generate();
    let trusted = TestCertificate::generate();
    let server = ScriptedServer::start(Script {
        tls: Some(served.acceptor.clone()),
        implicit_tls: true,
        ..Script::default()
    })
    .await;
    let mut transport =
        server.tls_transport(server.tls_settings(ConnectionSecurity::SslTlsRequired), &trusted);

    let err = transport.open().await.unwrap_err();
    assert!(matches!(err, Error::CertificateValidation(_)));
    assert!(!transport.is_open());
    assert!(server.commands().is_empty());
}

#[tokio::test]
async fn test_stalled_starttls_handshake_times_out() {
    let server = ScriptedServer::start(Script {
        ehlo: "250-test.example.com\r\n250 STARTTLS\r\n",
        ..Script::default()
    })
    .await;
    let config = ScriptedServer::config(
        server.tls_settings(ConnectionSecurity::StartTlsRequired),
        Duration::from_secs(1),
    )
    .build();
    let mut transport = SmtpTransport::new(config);

    let result = tokio::time::timeout(Duration::from_secs(10), transport.open())
        .await
        .unwrap();
    assert!(matches!(result, Err(Error::Timeout(_))));
    assert!(!transport.is_open());
    assert_eq!(server.commands().last().unwrap(), "STARTTLS");
}

//! POP3 Session state machine
//!
//! Message numbers on the wire are the persistent message ids. Deletions are
//! collected per session and committed in one statement on `QUIT`.

use super::command::Pop3Command;
use super::response::Pop3Response;
use crate::render::render;
use std::collections::BTreeSet;
use std::sync::Arc;
use tidemail_common::password;
use tidemail_common::types::{local_part, MessageId, RequestContext};
use tidemail_storage::{MessageRepository, User, UserRepository};
use tracing::{debug, error, info, warn};

/// POP3 session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not authenticated
    Authorization,
    /// Authenticated
    Transaction,
}

/// Storage shared by every POP3 session of a listener
#[derive(Clone)]
pub struct Pop3Backend {
    pub messages: Arc<dyn MessageRepository>,
    pub users: Arc<dyn UserRepository>,
    /// Domain used when rendering retrieved messages
    pub domain: String,
}

/// POP3 Session
pub struct Pop3Session {
    backend: Pop3Backend,
    state: SessionState,
    username: Option<String>,
    account: Option<User>,
    timestamp: String,
    deletions: BTreeSet<MessageId>,
    ctx: RequestContext,
}

fn parse_id(arg: &str) -> Option<MessageId> {
    arg.trim().parse::<MessageId>().ok().filter(|id| *id > 0)
}

impl Pop3Session {
    /// Create a session; `timestamp` is the `<...>` token sent in the greeting
    pub fn new(backend: Pop3Backend, timestamp: impl Into<String>) -> Self {
        Self {
            backend,
            state: SessionState::Authorization,
            username: None,
            account: None,
            timestamp: timestamp.into(),
            deletions: BTreeSet::new(),
            ctx: RequestContext::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    pub fn log_id(&self) -> &str {
        &self.ctx.log_id
    }

    /// Login stored by the last `USER`
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn account(&self) -> Option<&User> {
        self.account.as_ref()
    }

    pub fn pending_deletions(&self) -> &BTreeSet<MessageId> {
        &self.deletions
    }

    /// Handle one command; the flag asks the caller to close the connection
    pub async fn handle(&mut self, cmd: Pop3Command) -> (String, bool) {
        if cmd.requires_transaction() && self.state != SessionState::Transaction {
            return (Pop3Response::err("command not valid in this state"), false);
        }

        match cmd {
            Pop3Command::User { username } => (self.user(&username), false),
            Pop3Command::Pass { password } => (self.pass(&password).await, false),
            Pop3Command::Apop { name, digest } => (self.apop(&name, &digest).await, false),
            Pop3Command::Stat => (self.stat().await, false),
            Pop3Command::List { arg } => (self.list(arg.as_deref()).await, false),
            Pop3Command::Uidl { arg } => (self.uidl(arg.as_deref()).await, false),
            Pop3Command::Retr { arg } => (self.retr(&arg).await, false),
            Pop3Command::Dele { arg } => (self.dele(&arg), false),
            Pop3Command::Top => (Pop3Response::err("not supported"), false),
            Pop3Command::Rset => {
                self.deletions.clear();
                (Pop3Response::ok("maildrop reset"), false)
            }
            Pop3Command::Noop => (Pop3Response::ok(""), false),
            Pop3Command::Capa => (Pop3Response::capabilities(), false),
            Pop3Command::Quit => (self.quit().await, true),
            Pop3Command::Unknown { command } => {
                debug!(log_id = %self.ctx.log_id, command = %command, "Unknown POP3 command");
                (Pop3Response::err("unknown command"), false)
            }
        }
    }

    fn user(&mut self, username: &str) -> String {
        if self.state == SessionState::Transaction {
            return Pop3Response::err("already authenticated");
        }
        self.username = Some(local_part(username.trim()).to_string());
        Pop3Response::ok("send password")
    }

    async fn pass(&mut self, secret: &str) -> String {
        if self.state == SessionState::Transaction {
            return Pop3Response::err("already authenticated");
        }
        let Some(login) = self.username.clone() else {
            return Pop3Response::err("USER required first");
        };

        let hash = password::encode(secret);
        match self.backend.users.find_by_credentials(&login, &hash).await {
            Ok(Some(user)) => self.bind(user),
            Ok(None) => {
                info!(log_id = %self.ctx.log_id, login = %login, "POP3 password rejected");
                Pop3Response::err("authentication failed")
            }
            Err(e) => {
                error!(log_id = %self.ctx.log_id, "POP3 account lookup failed: {}", e);
                Pop3Response::err("authentication failed")
            }
        }
    }

    async fn apop(&mut self, name: &str, digest: &str) -> String {
        if self.state == SessionState::Transaction {
            return Pop3Response::err("already authenticated");
        }
        let login = local_part(name.trim()).to_string();

        match self.backend.users.find_by_account(&login).await {
            Ok(Some(user)) => {
                let expected = password::apop_digest(&self.timestamp, &user.password);
                if password::digest_eq(&expected, &digest.to_ascii_lowercase()) {
                    self.username = Some(login);
                    self.bind(user)
                } else {
                    info!(log_id = %self.ctx.log_id, login = %login, "POP3 APOP digest rejected");
                    Pop3Response::err("authentication failed")
                }
            }
            Ok(None) => Pop3Response::err("authentication failed"),
            Err(e) => {
                error!(log_id = %self.ctx.log_id, "POP3 account lookup failed: {}", e);
                Pop3Response::err("authentication failed")
            }
        }
    }

    fn bind(&mut self, user: User) -> String {
        info!(log_id = %self.ctx.log_id, account = %user.account, "POP3 login");
        self.ctx = self
            .ctx
            .clone()
            .with_user(user.id, user.name.clone(), user.account.clone());
        self.account = Some(user);
        self.state = SessionState::Transaction;
        Pop3Response::ok("maildrop locked and ready")
    }

    async fn stat(&self) -> String {
        match self.backend.messages.stat().await {
            Ok(stat) => Pop3Response::stat(stat.num, stat.size),
            Err(e) => {
                error!(log_id = %self.ctx.log_id, "POP3 STAT query failed: {}", e);
                Pop3Response::stat(0, 0)
            }
        }
    }

    async fn list(&self, arg: Option<&str>) -> String {
        let id = match arg {
            Some(arg) => match parse_id(arg) {
                Some(id) => Some(id),
                None => return Pop3Response::err("params error"),
            },
            None => None,
        };

        let sizes = self.backend.messages.list_sizes(id).await.unwrap_or_else(|e| {
            error!(log_id = %self.ctx.log_id, "POP3 LIST query failed: {}", e);
            Vec::new()
        });

        match id {
            Some(id) => match sizes.first() {
                Some(entry) => Pop3Response::ok(&format!("{} {}", entry.id, entry.size)),
                None => Pop3Response::err(&format!("no such message {}", id)),
            },
            None => Pop3Response::multi_line(
                &format!("{} messages", sizes.len()),
                sizes.iter().map(|s| format!("{} {}", s.id, s.size)),
            ),
        }
    }

    async fn uidl(&self, arg: Option<&str>) -> String {
        match arg {
            Some(arg) => match parse_id(arg) {
                Some(id) => Pop3Response::ok(&format!("{} {}", id, id)),
                None => Pop3Response::err("params error"),
            },
            None => {
                let ids = self.backend.messages.list_sizes(None).await.unwrap_or_else(|e| {
                    error!(log_id = %self.ctx.log_id, "POP3 UIDL query failed: {}", e);
                    Vec::new()
                });
                Pop3Response::multi_line("", ids.iter().map(|s| format!("{} {}", s.id, s.id)))
            }
        }
    }

    async fn retr(&self, arg: &str) -> String {
        let Some(id) = parse_id(arg) else {
            return Pop3Response::err("params error");
        };

        let email = match self.backend.messages.get(id).await {
            Ok(Some(email)) => email,
            Ok(None) => return Pop3Response::err(&format!("no such message {}", id)),
            Err(e) => {
                error!(log_id = %self.ctx.log_id, message_id = id, "POP3 RETR load failed: {}", e);
                return Pop3Response::err("server error");
            }
        };

        match render(&email, &self.backend.domain) {
            Ok(raw) => Pop3Response::message(&String::from_utf8_lossy(&raw)),
            Err(e) => {
                error!(
                    log_id = %self.ctx.log_id,
                    message_id = id,
                    "POP3 RETR render failed: {}",
                    e
                );
                Pop3Response::err("server error")
            }
        }
    }

    fn dele(&mut self, arg: &str) -> String {
        match parse_id(arg) {
            Some(id) => {
                self.deletions.insert(id);
                Pop3Response::ok(&format!("message {} deleted", id))
            }
            None => Pop3Response::err("params error"),
        }
    }

    async fn quit(&mut self) -> String {
        if self.state == SessionState::Transaction && !self.deletions.is_empty() {
            let ids: Vec<MessageId> = self.deletions.iter().copied().collect();
            match self.backend.messages.delete_many(&ids).await {
                Ok(count) => info!(log_id = %self.ctx.log_id, count, "POP3 deletions committed"),
                Err(e) => warn!(log_id = %self.ctx.log_id, "POP3 deletion commit failed: {}", e),
            }
            self.deletions.clear();
        }
        Pop3Response::ok("bye")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pop3::command::Pop3Parser;
    use pretty_assertions::assert_eq;
    use tidemail_common::types::{Email, Participant};
    use tidemail_storage::{DatabasePool, DbMessageRepository, DbUserRepository};

    struct Fixture {
        messages: Arc<DbMessageRepository>,
        session: Pop3Session,
    }

    async fn fixture() -> Fixture {
        let db = DatabasePool::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let messages = Arc::new(DbMessageRepository::new(db.clone()));
        let users = Arc::new(DbUserRepository::new(db));
        users
            .create("alice", "Alice", &password::encode("secret"), false)
            .await
            .unwrap();

        let backend = Pop3Backend {
            messages: messages.clone(),
            users,
            domain: "example.com".to_string(),
        };
        Fixture {
            messages,
            session: Pop3Session::new(backend, "<100.200@example.com>"),
        }
    }

    async fn send(session: &mut Pop3Session, line: &str) -> String {
        session.handle(Pop3Parser::parse(line)).await.0
    }

    async fn login(session: &mut Pop3Session) {
        send(session, "USER alice@example.com").await;
        assert!(send(session, "PASS secret").await.starts_with("+OK"));
    }

    async fn store(messages: &DbMessageRepository, text: &str) -> MessageId {
        messages
            .insert(&Email {
                subject: "s".to_string(),
                from: Participant::new("", "x@remote.test"),
                to: vec![Participant::new("", "alice@example.com")],
                text: text.to_string(),
                ..Default::default()
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_user_strips_domain() {
        let mut f = fixture().await;
        assert_eq!(send(&mut f.session, "USER alice@example.com").await, "+OK send password\r\n");
        assert_eq!(f.session.username(), Some("alice"));
        assert_eq!(f.session.state(), SessionState::Authorization);
    }

    #[tokio::test]
    async fn test_pass_authenticates() {
        let mut f = fixture().await;
        send(&mut f.session, "USER alice").await;
        assert_eq!(send(&mut f.session, "PASS wrong").await, "-ERR authentication failed\r\n");
        assert_eq!(f.session.state(), SessionState::Authorization);

        assert!(send(&mut f.session, "PASS secret").await.starts_with("+OK"));
        assert_eq!(f.session.state(), SessionState::Transaction);
        assert_eq!(f.session.account().unwrap().account, "alice");
    }

    #[tokio::test]
    async fn test_pass_without_user() {
        let mut f = fixture().await;
        assert!(send(&mut f.session, "PASS secret").await.starts_with("-ERR"));
    }

    #[tokio::test]
    async fn test_apop_authenticates() {
        let mut f = fixture().await;
        let digest = password::apop_digest("<100.200@example.com>", &password::encode("secret"));

        assert!(send(&mut f.session, "APOP alice deadbeef").await.starts_with("-ERR"));
        let command = format!("APOP alice@example.com {}", digest.to_uppercase());
        let reply = send(&mut f.session, &command).await;
        assert!(reply.starts_with("+OK"));
        assert_eq!(f.session.state(), SessionState::Transaction);
    }

    #[tokio::test]
    async fn test_transaction_commands_rejected_before_login() {
        let mut f = fixture().await;
        for line in ["STAT", "LIST", "UIDL", "RETR 1", "DELE 1", "RSET", "TOP 1 1"] {
            assert!(send(&mut f.session, line).await.starts_with("-ERR"), "{}", line);
        }
    }

    #[tokio::test]
    async fn test_stat_and_list() {
        let mut f = fixture().await;
        let a = store(&f.messages, "hello").await;
        let b = store(&f.messages, "hi").await;
        login(&mut f.session).await;

        assert_eq!(send(&mut f.session, "STAT").await, "+OK 2 7\r\n");
        assert_eq!(
            send(&mut f.session, "LIST").await,
            format!("+OK 2 messages\r\n{} 5\r\n{} 2\r\n.\r\n", a, b)
        );
        assert_eq!(send(&mut f.session, &format!("LIST {}", b)).await, format!("+OK {} 2\r\n", b));
        assert_eq!(send(&mut f.session, "LIST 0").await, "-ERR params error\r\n");
        assert_eq!(send(&mut f.session, "LIST -3").await, "-ERR params error\r\n");
        assert_eq!(send(&mut f.session, "LIST abc").await, "-ERR params error\r\n");
    }

    #[tokio::test]
    async fn test_uidl_is_the_id() {
        let mut f = fixture().await;
        let a = store(&f.messages, "x").await;
        login(&mut f.session).await;

        assert_eq!(
            send(&mut f.session, &format!("UIDL {}", a)).await,
            format!("+OK {} {}\r\n", a, a)
        );
        assert_eq!(send(&mut f.session, "UIDL").await, format!("+OK \r\n{} {}\r\n.\r\n", a, a));
    }

    #[tokio::test]
    async fn test_retr() {
        let mut f = fixture().await;
        let a = store(&f.messages, "the body").await;
        login(&mut f.session).await;

        let reply = send(&mut f.session, &format!("RETR {}", a)).await;
        assert!(reply.starts_with("+OK "));
        assert!(reply.contains("the body"));
        assert!(reply.ends_with("\r\n.\r\n"));

        assert!(send(&mut f.session, "RETR 9999").await.starts_with("-ERR"));
    }

    #[tokio::test]
    async fn test_top_not_supported() {
        let mut f = fixture().await;
        login(&mut f.session).await;
        assert_eq!(send(&mut f.session, "TOP 1 10").await, "-ERR not supported\r\n");
    }

    #[tokio::test]
    async fn test_deletions_commit_on_quit() {
        let mut f = fixture().await;
        let a = store(&f.messages, "a").await;
        let b = store(&f.messages, "b").await;
        let c = store(&f.messages, "c").await;
        login(&mut f.session).await;

        send(&mut f.session, &format!("DELE {}", a)).await;
        send(&mut f.session, &format!("DELE {}", a)).await;
        send(&mut f.session, &format!("DELE {}", c)).await;
        assert_eq!(f.session.pending_deletions().len(), 2);
        assert_eq!(f.messages.stat().await.unwrap().num, 3);

        let (reply, close) = f.session.handle(Pop3Command::Quit).await;
        assert_eq!(reply, "+OK bye\r\n");
        assert!(close);

        let remaining: Vec<_> =
            f.messages.list_sizes(None).await.unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(remaining, vec![b]);
    }

    #[tokio::test]
    async fn test_rset_clears_deletions() {
        let mut f = fixture().await;
        let a = store(&f.messages, "a").await;
        login(&mut f.session).await;

        send(&mut f.session, &format!("DELE {}", a)).await;
        send(&mut f.session, "RSET").await;
        assert!(f.session.pending_deletions().is_empty());
        send(&mut f.session, "QUIT").await;

        assert_eq!(f.messages.stat().await.unwrap().num, 1);
    }

    #[tokio::test]
    async fn test_disconnect_without_quit_keeps_messages() {
        let mut f = fixture().await;
        let a = store(&f.messages, "a").await;
        login(&mut f.session).await;
        send(&mut f.session, &format!("DELE {}", a)).await;
        drop(f.session);

        assert_eq!(f.messages.stat().await.unwrap().num, 1);
    }
}

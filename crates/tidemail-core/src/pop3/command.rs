//! POP3 Command definitions

/// POP3 Command
///
/// Message-number arguments are kept as raw text; the session validates them
/// so a malformed number gets a parameter error rather than "unknown command".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pop3Command {
    /// USER name
    User { username: String },
    /// PASS secret
    Pass { password: String },
    /// APOP name digest
    Apop { name: String, digest: String },
    Stat,
    /// LIST [msg]
    List { arg: Option<String> },
    /// UIDL [msg]
    Uidl { arg: Option<String> },
    /// RETR msg
    Retr { arg: String },
    /// DELE msg
    Dele { arg: String },
    /// TOP msg n
    Top,
    Noop,
    Rset,
    Quit,
    Capa,
    Unknown { command: String },
}

impl Pop3Command {
    /// Whether the command is only valid after authentication
    pub fn requires_transaction(&self) -> bool {
        matches!(
            self,
            Pop3Command::Stat
                | Pop3Command::List { .. }
                | Pop3Command::Uidl { .. }
                | Pop3Command::Retr { .. }
                | Pop3Command::Dele { .. }
                | Pop3Command::Top
                | Pop3Command::Rset
        )
    }
}

/// POP3 Command Parser
pub struct Pop3Parser;

impl Pop3Parser {
    /// Parse a POP3 command line
    pub fn parse(line: &str) -> Pop3Command {
        let line = line.trim();
        if line.is_empty() {
            return Pop3Command::Unknown {
                command: String::new(),
            };
        }

        let (cmd, args) = match line.split_once(' ') {
            Some((cmd, args)) => (cmd.to_uppercase(), args.trim()),
            None => (line.to_uppercase(), ""),
        };
        let optional = |args: &str| {
            if args.is_empty() {
                None
            } else {
                Some(args.to_string())
            }
        };

        match cmd.as_str() {
            "USER" => Pop3Command::User {
                username: args.to_string(),
            },
            "PASS" => Pop3Command::Pass {
                password: args.to_string(),
            },
            "APOP" => match args.split_once(' ') {
                Some((name, digest)) => Pop3Command::Apop {
                    name: name.to_string(),
                    digest: digest.trim().to_string(),
                },
                None => Pop3Command::Unknown { command: cmd },
            },
            "STAT" => Pop3Command::Stat,
            "LIST" => Pop3Command::List { arg: optional(args) },
            "UIDL" => Pop3Command::Uidl { arg: optional(args) },
            "RETR" => Pop3Command::Retr {
                arg: args.to_string(),
            },
            "DELE" => Pop3Command::Dele {
                arg: args.to_string(),
            },
            "TOP" => Pop3Command::Top,
            "NOOP" => Pop3Command::Noop,
            "RSET" => Pop3Command::Rset,
            "QUIT" => Pop3Command::Quit,
            "CAPA" => Pop3Command::Capa,
            _ => Pop3Command::Unknown { command: cmd },
        }
    }
}

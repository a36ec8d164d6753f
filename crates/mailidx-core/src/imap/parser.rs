//! IMAP Command Parser
//!
//! Parses IMAP4 command lines into [`TaggedCommand`]s. SEARCH arguments go
//! through a small tokenizer and a recursive descent over the search-key
//! grammar.

use super::command::{FetchItem, ImapCommand, StoreFlags, StoreOperation, TaggedCommand};
use crate::index::key::parse_date;
use crate::index::SearchKey;
use mailidx_common::flags;
use mailidx_common::types::{Property, SequenceSet};

/// IMAP command parser
pub struct ImapParser;

impl ImapParser {
    /// Parse an IMAP command line
    pub fn parse(line: &str) -> Option<TaggedCommand> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let (tag, rest) = match line.split_once(' ') {
            Some((tag, rest)) => (tag, rest.trim()),
            None => (line, ""),
        };

        let command = Self::parse_command(rest)?;
        Some(TaggedCommand {
            tag: tag.to_string(),
            command,
        })
    }

    /// Parse the command portion
    fn parse_command(input: &str) -> Option<ImapCommand> {
        let (name, args) = input.split_once(' ').unwrap_or((input, ""));
        let name = name.to_uppercase();

        match name.as_str() {
            "" => None,

            // Any state
            "CAPABILITY" => Some(ImapCommand::Capability),
            "NOOP" => Some(ImapCommand::Noop),
            "LOGOUT" => Some(ImapCommand::Logout),

            // Not authenticated
            "LOGIN" => Self::parse_login(args),

            // Authenticated state
            "SELECT" => Some(ImapCommand::Select {
                mailbox: Self::parse_mailbox(args)?,
            }),
            "EXAMINE" => Some(ImapCommand::Examine {
                mailbox: Self::parse_mailbox(args)?,
            }),
            "STATUS" => Self::parse_status(args),
            "CLOSE" => Some(ImapCommand::Close),

            // Selected state
            "FETCH" => Self::parse_fetch(args, false),
            "SEARCH" => Self::parse_search(args, false),
            "STORE" => Self::parse_store(args, false),
            "UID" => Self::parse_uid_command(args),

            _ => Some(ImapCommand::Unknown { command: name }),
        }
    }

    fn parse_login(args: &str) -> Option<ImapCommand> {
        let (username, rest) = Self::parse_astring(args)?;
        let (password, _) = Self::parse_astring(rest)?;
        Some(ImapCommand::Login { username, password })
    }

    /// STATUS mailbox (item1 item2 ...)
    fn parse_status(args: &str) -> Option<ImapCommand> {
        let (mailbox, rest) = Self::parse_astring(args)?;
        let content = rest.trim().strip_prefix('(')?.strip_suffix(')')?;
        let items = content.split_whitespace().map(|s| s.to_uppercase()).collect();
        Some(ImapCommand::Status { mailbox, items })
    }

    fn parse_fetch(args: &str, uid: bool) -> Option<ImapCommand> {
        let (sequence, items) = args.trim().split_once(' ')?;
        Some(ImapCommand::Fetch {
            sequence: SequenceSet::parse(sequence)?,
            items: FetchItem::parse_list(items)?,
            uid,
        })
    }

    fn parse_search(args: &str, uid: bool) -> Option<ImapCommand> {
        let tokens = tokenize(args)?;
        let keys = SearchParser::new(tokens).parse()?;
        Some(ImapCommand::Search { keys, uid })
    }

    /// UID FETCH/SEARCH/STORE
    fn parse_uid_command(args: &str) -> Option<ImapCommand> {
        let (sub, sub_args) = args.trim().split_once(' ').unwrap_or((args.trim(), ""));
        let sub = sub.to_uppercase();

        match sub.as_str() {
            "FETCH" => Self::parse_fetch(sub_args, true),
            "SEARCH" => Self::parse_search(sub_args, true),
            "STORE" => Self::parse_store(sub_args, true),
            _ => Some(ImapCommand::Unknown {
                command: format!("UID {}", sub),
            }),
        }
    }

    /// STORE sequence +FLAGS|-FLAGS|FLAGS[.SILENT] (flags...)
    fn parse_store(args: &str, uid: bool) -> Option<ImapCommand> {
        let (sequence, rest) = args.trim().split_once(' ')?;
        let sequence = SequenceSet::parse(sequence)?;
        let flags = Self::parse_store_flags(rest)?;
        Some(ImapCommand::Store {
            sequence,
            flags,
            uid,
        })
    }

    fn parse_store_flags(args: &str) -> Option<StoreFlags> {
        let (item, rest) = args.trim().split_once(' ').unwrap_or((args.trim(), ""));
        let item = item.to_uppercase();

        let (operation, name) = if let Some(name) = item.strip_prefix('+') {
            (StoreOperation::Add, name)
        } else if let Some(name) = item.strip_prefix('-') {
            (StoreOperation::Remove, name)
        } else {
            (StoreOperation::Replace, item.as_str())
        };

        let silent = match name {
            "FLAGS" => false,
            "FLAGS.SILENT" => true,
            _ => return None,
        };

        Some(StoreFlags {
            operation,
            silent,
            flags: Self::parse_flags_list(rest),
        })
    }

    /// Parse a parenthesized or bare flags list
    fn parse_flags_list(args: &str) -> Vec<String> {
        let args = args.trim();
        let content = args
            .strip_prefix('(')
            .and_then(|s| s.strip_suffix(')'))
            .unwrap_or(args);
        flags::tokens(content).map(str::to_string).collect()
    }

    fn parse_mailbox(s: &str) -> Option<String> {
        let (mailbox, _) = Self::parse_astring(s)?;
        if mailbox.is_empty() {
            return None;
        }
        Some(mailbox)
    }

    /// Parse an astring (atom or quoted string).
    /// Returns the parsed string and remaining input.
    fn parse_astring(s: &str) -> Option<(String, &str)> {
        let s = s.trim_start();
        if s.is_empty() {
            return None;
        }

        if let Some(quoted) = s.strip_prefix('"') {
            let mut result = String::new();
            let mut escaped = false;
            for (i, c) in quoted.char_indices() {
                if escaped {
                    result.push(c);
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == '"' {
                    return Some((result, &quoted[i + 1..]));
                } else {
                    result.push(c);
                }
            }
            // Unterminated
            None
        } else {
            let end = s.find(' ').unwrap_or(s.len());
            Some((s[..end].to_string(), &s[end..]))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    LParen,
    RParen,
    Atom(String),
    Quoted(String),
}

fn tokenize(s: &str) -> Option<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = s.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\r' | '\n' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '"' => {
                chars.next();
                let mut value = String::new();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => value.push(chars.next()?),
                        '"' => {
                            closed = true;
                            break;
                        }
                        _ => value.push(c),
                    }
                }
                if !closed {
                    return None;
                }
                tokens.push(Token::Quoted(value));
            }
            _ => {
                let mut atom = String::new();
                while let Some(&c) = chars.peek() {
                    if matches!(c, ' ' | '\t' | '\r' | '\n' | '(' | ')' | '"') {
                        break;
                    }
                    atom.push(c);
                    chars.next();
                }
                tokens.push(Token::Atom(atom));
            }
        }
    }

    Some(tokens)
}

/// Recursive descent over search keys
struct SearchParser {
    tokens: Vec<Token>,
    pos: usize,
}

impl SearchParser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn parse(mut self) -> Option<Vec<SearchKey>> {
        if let Some(Token::Atom(atom)) = self.peek() {
            if atom.eq_ignore_ascii_case("CHARSET") {
                self.pos += 1;
                // Everything is matched as UTF-8
                self.astring()?;
            }
        }

        let mut keys = Vec::new();
        while self.peek().is_some() {
            keys.push(self.key()?);
        }
        if keys.is_empty() {
            return None;
        }
        Some(keys)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn astring(&mut self) -> Option<String> {
        match self.next()? {
            Token::Atom(s) | Token::Quoted(s) => Some(s),
            _ => None,
        }
    }

    fn atom(&mut self) -> Option<String> {
        match self.next()? {
            Token::Atom(s) => Some(s),
            _ => None,
        }
    }

    fn number(&mut self) -> Option<u64> {
        self.atom()?.parse().ok()
    }

    fn date(&mut self) -> Option<chrono::NaiveDate> {
        parse_date(&self.astring()?).ok()
    }

    fn header(&mut self, property: Property) -> Option<SearchKey> {
        Some(SearchKey::Header(property, self.astring()?))
    }

    fn key(&mut self) -> Option<SearchKey> {
        let name = match self.next()? {
            Token::LParen => {
                let mut keys = Vec::new();
                loop {
                    match self.peek()? {
                        Token::RParen => {
                            self.pos += 1;
                            break;
                        }
                        _ => keys.push(self.key()?),
                    }
                }
                return Some(SearchKey::Group(keys));
            }
            Token::Atom(name) => name,
            _ => return None,
        };

        let flag = |f: &str| Some(SearchKey::Flag(f.to_string()));
        let no_flag = |f: &str| Some(SearchKey::NoFlag(f.to_string()));

        match name.to_uppercase().as_str() {
            "ALL" => Some(SearchKey::All),
            "BODY" | "TEXT" => Some(SearchKey::Body(self.astring()?)),
            "HEADER" => {
                let header = self.astring()?;
                let value = self.astring()?;
                match Property::from_header(&header) {
                    Some(property) => Some(SearchKey::Header(property, value)),
                    None => Some(SearchKey::All),
                }
            }
            "SUBJECT" => self.header(Property::Subject),
            "FROM" => self.header(Property::From),
            "TO" => self.header(Property::To),
            "CC" => self.header(Property::Cc),
            "BCC" => self.header(Property::Bcc),
            "BEFORE" => Some(SearchKey::Before(self.date()?)),
            "ON" => Some(SearchKey::On(self.date()?)),
            "SINCE" => Some(SearchKey::Since(self.date()?)),
            "SENTBEFORE" => Some(SearchKey::SentBefore(self.date()?)),
            "SENTON" => Some(SearchKey::SentOn(self.date()?)),
            "SENTSINCE" => Some(SearchKey::SentSince(self.date()?)),
            "LARGER" => Some(SearchKey::Larger(self.number()?)),
            "SMALLER" => Some(SearchKey::Smaller(self.number()?)),
            "ANSWERED" => flag(flags::ANSWERED),
            "DELETED" => flag(flags::DELETED),
            "DRAFT" => flag(flags::DRAFT),
            "FLAGGED" => flag(flags::FLAGGED),
            "RECENT" | "NEW" => flag(flags::RECENT),
            "SEEN" => flag(flags::SEEN),
            "KEYWORD" => Some(SearchKey::Keyword(self.atom()?)),
            "UNANSWERED" => no_flag(flags::ANSWERED),
            "UNDELETED" => no_flag(flags::DELETED),
            "UNDRAFT" => no_flag(flags::DRAFT),
            "UNFLAGGED" => no_flag(flags::FLAGGED),
            "UNSEEN" => no_flag(flags::SEEN),
            "OLD" => no_flag(flags::RECENT),
            "UNKEYWORD" => Some(SearchKey::NoKeyword(self.atom()?)),
            "NOT" => Some(SearchKey::not(self.key()?)),
            "OR" => {
                let a = self.key()?;
                let b = self.key()?;
                Some(SearchKey::or(a, b))
            }
            "UID" => Some(SearchKey::Uid(SequenceSet::parse(&self.atom()?)?)),
            _ => match SequenceSet::parse(&name) {
                Some(set) => Some(SearchKey::SequenceNumber(set)),
                // Unknown keys match everything
                None => Some(SearchKey::All),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    fn search(line: &str) -> Vec<SearchKey> {
        match ImapParser::parse(line).unwrap().command {
            ImapCommand::Search { keys, .. } => keys,
            other => panic!("Expected SEARCH command, got {:?}", other),
        }
    }

    fn body(s: &str) -> SearchKey {
        SearchKey::Body(s.to_string())
    }

    #[test]
    fn test_parse_capability() {
        let cmd = ImapParser::parse("A001 CAPABILITY").unwrap();
        assert_eq!(cmd.tag, "A001");
        assert_eq!(cmd.command, ImapCommand::Capability);
    }

    #[test]
    fn test_parse_login_quoted() {
        let cmd = ImapParser::parse(r#"A002 LOGIN "user@example.com" "pass \"word\"""#).unwrap();
        assert_eq!(
            cmd.command,
            ImapCommand::Login {
                username: "user@example.com".to_string(),
                password: "pass \"word\"".to_string(),
            }
        );
        assert_eq!(ImapParser::parse("A002 LOGIN user"), None);
    }

    #[test]
    fn test_parse_select_and_status() {
        let cmd = ImapParser::parse("A003 SELECT \"INBOX\"").unwrap();
        assert_eq!(
            cmd.command,
            ImapCommand::Select {
                mailbox: "INBOX".to_string()
            }
        );

        let cmd = ImapParser::parse("A004 STATUS INBOX (messages UNSEEN uidnext)").unwrap();
        assert_eq!(
            cmd.command,
            ImapCommand::Status {
                mailbox: "INBOX".to_string(),
                items: vec![
                    "MESSAGES".to_string(),
                    "UNSEEN".to_string(),
                    "UIDNEXT".to_string()
                ],
            }
        );
    }

    #[test]
    fn test_parse_uid_fetch() {
        let cmd = ImapParser::parse("A005 UID FETCH 1:100 (FLAGS UID)").unwrap();
        assert_eq!(
            cmd.command,
            ImapCommand::Fetch {
                sequence: SequenceSet::parse("1:100").unwrap(),
                items: vec![FetchItem::Flags, FetchItem::Uid],
                uid: true,
            }
        );
        assert_eq!(ImapParser::parse("A005 FETCH 1 (RFC822)"), None);
    }

    #[test]
    fn test_parse_store() {
        let cmd = ImapParser::parse("A006 STORE 1,2 +FLAGS.SILENT ($Forwarded \\Seen)").unwrap();
        assert_eq!(
            cmd.command,
            ImapCommand::Store {
                sequence: SequenceSet::parse("1,2").unwrap(),
                flags: StoreFlags {
                    operation: StoreOperation::Add,
                    silent: true,
                    flags: vec!["$Forwarded".to_string(), "\\Seen".to_string()],
                },
                uid: false,
            }
        );

        let cmd = ImapParser::parse("A007 UID STORE 5 flags ()").unwrap();
        assert_eq!(
            cmd.command,
            ImapCommand::Store {
                sequence: SequenceSet::parse("5").unwrap(),
                flags: StoreFlags {
                    operation: StoreOperation::Replace,
                    silent: false,
                    flags: vec![],
                },
                uid: true,
            }
        );
        assert_eq!(ImapParser::parse("A008 STORE 1 LABELS (x)"), None);
    }

    #[test]
    fn test_parse_search_flags() {
        assert_eq!(
            search("A011 SEARCH BODY hello UNSEEN"),
            vec![body("hello"), SearchKey::NoFlag("\\Seen".to_string())]
        );
        assert_eq!(
            search("A115 SEARCH not flagged not seen"),
            vec![
                SearchKey::not(SearchKey::Flag("\\Flagged".to_string())),
                SearchKey::not(SearchKey::Flag("\\Seen".to_string())),
            ]
        );
        assert_eq!(
            search("A1 SEARCH NEW OLD"),
            vec![
                SearchKey::Flag("\\Recent".to_string()),
                SearchKey::NoFlag("\\Recent".to_string()),
            ]
        );
        assert_eq!(
            search("A202 SEARCH KEYWORD $Forwarded"),
            vec![SearchKey::Keyword("$Forwarded".to_string())]
        );
    }

    #[test]
    fn test_parse_search_charset_and_headers() {
        assert_eq!(
            search("A004 SEARCH CHARSET US-ASCII BODY \"hello, world\""),
            vec![body("hello, world")]
        );
        assert_eq!(
            search("A008 SEARCH HEADER SUBJECT hello"),
            vec![SearchKey::Header(Property::Subject, "hello".to_string())]
        );
        assert_eq!(
            search("A009 SEARCH HEADER X-ML-NAME ruby-list"),
            vec![SearchKey::Header(Property::XMlName, "ruby-list".to_string())]
        );
        assert_eq!(
            search("A010 SEARCH HEADER Message-Id foo"),
            vec![SearchKey::All]
        );
    }

    #[test]
    fn test_parse_search_groups_and_or() {
        let or = SearchKey::or(
            SearchKey::not(SearchKey::Header(Property::To, "foo".to_string())),
            SearchKey::Header(Property::Cc, "foo".to_string()),
        );
        let bcc = SearchKey::Header(Property::Bcc, "foo".to_string());
        assert_eq!(
            search("A404 SEARCH BCC foo (OR NOT TO foo CC foo) BCC foo"),
            vec![bcc.clone(), SearchKey::Group(vec![or]), bcc]
        );
    }

    #[test]
    fn test_parse_search_dates_sizes_and_sets() {
        let date = NaiveDate::from_ymd_opt(2005, 4, 1).unwrap();
        assert_eq!(
            search("A1 SEARCH SENTSINCE 1-Apr-2005 ON \"1-Apr-2005\" LARGER 250"),
            vec![
                SearchKey::SentSince(date),
                SearchKey::On(date),
                SearchKey::Larger(250),
            ]
        );
        assert_eq!(
            search("A1 SEARCH UID 12,13 2:4"),
            vec![
                SearchKey::Uid(SequenceSet::parse("12,13").unwrap()),
                SearchKey::SequenceNumber(SequenceSet::parse("2:4").unwrap()),
            ]
        );
        assert_eq!(search("A1 SEARCH FROBNICATE"), vec![SearchKey::All]);
    }

    #[test]
    fn test_parse_search_errors() {
        assert_eq!(ImapParser::parse("A1 SEARCH SINCE 2005-04-01"), None);
        assert_eq!(ImapParser::parse("A1 SEARCH LARGER big"), None);
        assert_eq!(ImapParser::parse("A1 SEARCH (SEEN"), None);
        assert_eq!(ImapParser::parse("A1 SEARCH BODY \"open"), None);
        assert_eq!(ImapParser::parse("A1 SEARCH"), None);
    }
}

//! Command Classification
//!
//! Classifies a complete client command from its opcode and, for text
//! queries, a lexical scan of the SQL. The scan only looks at keywords: it
//! never parses expressions and never executes anything.
//!
//! The result tells the router:
//! - whether the command reads or writes,
//! - whether it opens or closes a transaction (or flips autocommit),
//! - whether it is a *session command* that must be replayed on every
//!   backend the session uses later,
//! - whether the text holds more than one statement,
//! - whether it starts a `LOAD DATA LOCAL INFILE` bulk transfer.

use crate::protocol::types::Command;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Bit set describing what a command does.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TypeMask(u32);

impl TypeMask {
    pub const UNKNOWN: TypeMask = TypeMask(0);
    pub const LOCAL_READ: TypeMask = TypeMask(0x0000_0001);
    pub const READ: TypeMask = TypeMask(0x0000_0002);
    pub const WRITE: TypeMask = TypeMask(0x0000_0004);
    pub const MASTER_READ: TypeMask = TypeMask(0x0000_0008);
    pub const SESSION_WRITE: TypeMask = TypeMask(0x0000_0010);
    pub const USERVAR_READ: TypeMask = TypeMask(0x0000_0040);
    pub const SYSVAR_READ: TypeMask = TypeMask(0x0000_0080);
    pub const GSYSVAR_WRITE: TypeMask = TypeMask(0x0000_0400);
    pub const BEGIN_TRX: TypeMask = TypeMask(0x0000_0800);
    pub const ENABLE_AUTOCOMMIT: TypeMask = TypeMask(0x0000_1000);
    pub const DISABLE_AUTOCOMMIT: TypeMask = TypeMask(0x0000_2000);
    pub const ROLLBACK: TypeMask = TypeMask(0x0000_4000);
    pub const COMMIT: TypeMask = TypeMask(0x0000_8000);
    pub const PREPARE_NAMED_STMT: TypeMask = TypeMask(0x0001_0000);
    pub const PREPARE_STMT: TypeMask = TypeMask(0x0002_0000);
    pub const EXEC_STMT: TypeMask = TypeMask(0x0004_0000);
    pub const CREATE_TMP_TABLE: TypeMask = TypeMask(0x0008_0000);
    pub const SHOW_DATABASES: TypeMask = TypeMask(0x0020_0000);
    pub const SHOW_TABLES: TypeMask = TypeMask(0x0040_0000);
    pub const READONLY: TypeMask = TypeMask(0x0080_0000);
    pub const READWRITE: TypeMask = TypeMask(0x0100_0000);
    pub const NEXT_TRX: TypeMask = TypeMask(0x0200_0000);

    const NAMES: &'static [(TypeMask, &'static str)] = &[
        (TypeMask::LOCAL_READ, "LOCAL_READ"),
        (TypeMask::READ, "READ"),
        (TypeMask::WRITE, "WRITE"),
        (TypeMask::MASTER_READ, "MASTER_READ"),
        (TypeMask::SESSION_WRITE, "SESSION_WRITE"),
        (TypeMask::USERVAR_READ, "USERVAR_READ"),
        (TypeMask::SYSVAR_READ, "SYSVAR_READ"),
        (TypeMask::GSYSVAR_WRITE, "GSYSVAR_WRITE"),
        (TypeMask::BEGIN_TRX, "BEGIN_TRX"),
        (TypeMask::ENABLE_AUTOCOMMIT, "ENABLE_AUTOCOMMIT"),
        (TypeMask::DISABLE_AUTOCOMMIT, "DISABLE_AUTOCOMMIT"),
        (TypeMask::ROLLBACK, "ROLLBACK"),
        (TypeMask::COMMIT, "COMMIT"),
        (TypeMask::PREPARE_NAMED_STMT, "PREPARE_NAMED_STMT"),
        (TypeMask::PREPARE_STMT, "PREPARE_STMT"),
        (TypeMask::EXEC_STMT, "EXEC_STMT"),
        (TypeMask::CREATE_TMP_TABLE, "CREATE_TMP_TABLE"),
        (TypeMask::SHOW_DATABASES, "SHOW_DATABASES"),
        (TypeMask::SHOW_TABLES, "SHOW_TABLES"),
        (TypeMask::READONLY, "READONLY"),
        (TypeMask::READWRITE, "READWRITE"),
        (TypeMask::NEXT_TRX, "NEXT_TRX"),
    ];

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: TypeMask) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: TypeMask) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_unknown(self) -> bool {
        self.0 == 0
    }

    /// True for statements that can run on any replica.
    pub fn is_read_only(self) -> bool {
        self.intersects(TypeMask::READ | TypeMask::LOCAL_READ)
            && !self.intersects(TypeMask::WRITE | TypeMask::MASTER_READ)
    }
}

impl BitOr for TypeMask {
    type Output = TypeMask;

    fn bitor(self, rhs: TypeMask) -> TypeMask {
        TypeMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for TypeMask {
    fn bitor_assign(&mut self, rhs: TypeMask) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for TypeMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeMask({})", self)
    }
}

impl fmt::Display for TypeMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unknown() {
            return f.write_str("UNKNOWN");
        }
        let mut first = true;
        for (flag, name) in TypeMask::NAMES {
            if self.contains(*flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Classification of one client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInfo {
    pub command: Command,
    pub type_mask: TypeMask,
    /// Must be replayed on every backend of the session
    pub session_command: bool,
    /// The query text holds more than one statement
    pub multi_statement: bool,
    /// `LOAD DATA LOCAL INFILE`: the client will stream a file next
    pub bulk_load: bool,
}

impl CommandInfo {
    fn new(command: Command, type_mask: TypeMask) -> Self {
        Self {
            command,
            type_mask,
            session_command: false,
            multi_statement: false,
            bulk_load: false,
        }
    }

    fn session(mut self) -> Self {
        self.session_command = true;
        self
    }
}

/// Classification of a SQL text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SqlInfo {
    pub type_mask: TypeMask,
    pub session_command: bool,
    pub multi_statement: bool,
    pub bulk_load: bool,
}

/// Classifies a complete command payload (opcode byte first).
pub fn classify(payload: &[u8]) -> CommandInfo {
    let Some(&opcode) = payload.first() else {
        return CommandInfo::new(Command::Unknown(0), TypeMask::UNKNOWN);
    };
    let command = Command::from_byte(opcode);
    let body = &payload[1..];

    match command {
        Command::Query => {
            let sql = classify_sql(body);
            CommandInfo {
                command,
                type_mask: sql.type_mask,
                session_command: sql.session_command,
                multi_statement: sql.multi_statement,
                bulk_load: sql.bulk_load,
            }
        }
        Command::StmtPrepare => CommandInfo::new(command, TypeMask::PREPARE_STMT).session(),
        Command::StmtClose | Command::StmtReset => {
            CommandInfo::new(command, TypeMask::SESSION_WRITE).session()
        }
        Command::StmtExecute
        | Command::StmtFetch
        | Command::StmtBulkExecute
        | Command::StmtSendLongData => CommandInfo::new(command, TypeMask::EXEC_STMT),
        Command::InitDb
        | Command::SetOption
        | Command::ChangeUser
        | Command::ResetConnection => {
            CommandInfo::new(command, TypeMask::SESSION_WRITE).session()
        }
        Command::FieldList => CommandInfo::new(command, TypeMask::READ),
        Command::Ping
        | Command::Statistics
        | Command::Time
        | Command::Sleep
        | Command::Quit
        | Command::ProcessInfo
        | Command::Debug => CommandInfo::new(command, TypeMask::LOCAL_READ),
        Command::CreateDb
        | Command::DropDb
        | Command::Refresh
        | Command::Shutdown
        | Command::ProcessKill
        | Command::BinlogDump
        | Command::RegisterSlave
        | Command::TableDump
        | Command::DelayedInsert
        | Command::Connect
        | Command::ConnectOut
        | Command::Daemon
        | Command::Multi
        | Command::Unknown(_) => CommandInfo::new(command, TypeMask::WRITE),
    }
}

/// Classifies SQL text by its leading keywords.
pub fn classify_sql(sql: &[u8]) -> SqlInfo {
    let mut lexer = Lexer::new(sql);
    let mut info = SqlInfo {
        multi_statement: has_multiple_statements(sql),
        ..SqlInfo::default()
    };

    let Some(first) = lexer.next_token() else {
        return info;
    };

    match first {
        Token::Word(w) if eq(w, "BEGIN") => {
            info.type_mask = parse_work_suffix(&mut lexer, TypeMask::BEGIN_TRX);
        }
        Token::Word(w) if eq(w, "COMMIT") => {
            info.type_mask = parse_work_suffix(&mut lexer, TypeMask::COMMIT);
        }
        Token::Word(w) if eq(w, "ROLLBACK") => {
            info.type_mask = parse_work_suffix(&mut lexer, TypeMask::ROLLBACK);
        }
        Token::Word(w) if eq(w, "START") => {
            info.type_mask = parse_start(&mut lexer);
        }
        Token::Word(w) if eq(w, "SET") => {
            let (mask, session) = parse_set(&mut lexer);
            info.type_mask = mask;
            info.session_command = session;
        }
        Token::Word(w) if eq(w, "USE") => {
            info.type_mask = TypeMask::SESSION_WRITE;
            info.session_command = true;
        }
        Token::Word(w) if eq(w, "XA") => {
            info.type_mask = match lexer.next_token() {
                Some(Token::Word(w)) if eq(w, "START") || eq(w, "BEGIN") => TypeMask::BEGIN_TRX,
                Some(Token::Word(w)) if eq(w, "END") => TypeMask::COMMIT,
                _ => TypeMask::WRITE,
            };
        }
        Token::Word(w) if eq(w, "PREPARE") => {
            info.type_mask = TypeMask::PREPARE_NAMED_STMT;
            info.session_command = true;
        }
        Token::Word(w) if eq(w, "DEALLOCATE") => {
            info.type_mask = TypeMask::SESSION_WRITE;
            info.session_command = true;
        }
        Token::Word(w) if eq(w, "EXECUTE") => {
            info.type_mask = TypeMask::EXEC_STMT;
        }
        Token::Word(w) if eq(w, "SELECT") || eq(w, "WITH") => {
            info.type_mask = parse_select(&mut lexer);
        }
        Token::Word(w) if eq(w, "SHOW") => {
            info.type_mask = match lexer.next_token() {
                Some(Token::Word(w)) if eq(w, "DATABASES") => {
                    TypeMask::READ | TypeMask::SHOW_DATABASES
                }
                Some(Token::Word(w)) if eq(w, "TABLES") => TypeMask::READ | TypeMask::SHOW_TABLES,
                _ => TypeMask::READ,
            };
        }
        Token::Word(w) if eq(w, "DESCRIBE") || eq(w, "DESC") || eq(w, "EXPLAIN") => {
            info.type_mask = TypeMask::READ;
        }
        Token::Word(w) if eq(w, "CREATE") => {
            info.type_mask = match lexer.next_token() {
                Some(Token::Word(w)) if eq(w, "TEMPORARY") => {
                    TypeMask::WRITE | TypeMask::CREATE_TMP_TABLE
                }
                _ => TypeMask::WRITE,
            };
        }
        Token::Word(w) if eq(w, "LOAD") => {
            info.type_mask = TypeMask::WRITE;
            info.bulk_load = is_load_data_local(&mut lexer);
        }
        Token::Word(_) => {
            // INSERT, UPDATE, DELETE, DDL, CALL, LOCK ... and anything we do
            // not recognize must go to the primary.
            info.type_mask = TypeMask::WRITE;
        }
        Token::Symbol(b'(') => {
            info.type_mask = parse_select(&mut lexer);
        }
        _ => {}
    }

    info
}

/// `<KEYWORD> [WORK]`, and for COMMIT and ROLLBACK `[AND [NO] CHAIN] [[NO]
/// RELEASE]`. `AND CHAIN` opens the next transaction right away. Anything else
/// after the keyword (e.g. `ROLLBACK TO SAVEPOINT`) is not a transaction
/// boundary.
fn parse_work_suffix(lexer: &mut Lexer<'_>, mask: TypeMask) -> TypeMask {
    let mut token = lexer.next_token();
    let mut work = false;
    if matches!(token, Some(Token::Word(w)) if eq(w, "WORK")) {
        work = true;
        token = lexer.next_token();
    }

    let mut result = mask;
    if mask != TypeMask::BEGIN_TRX {
        if matches!(token, Some(Token::Word(w)) if eq(w, "AND")) {
            let mut next = lexer.next_token();
            let no = matches!(next, Some(Token::Word(w)) if eq(w, "NO"));
            if no {
                next = lexer.next_token();
            }
            if !matches!(next, Some(Token::Word(w)) if eq(w, "CHAIN")) {
                return TypeMask::UNKNOWN;
            }
            if !no {
                result |= TypeMask::BEGIN_TRX;
            }
            token = lexer.next_token();
            work = true;
        }
        if matches!(token, Some(Token::Word(w)) if eq(w, "NO")) {
            token = lexer.next_token();
            if !matches!(token, Some(Token::Word(w)) if eq(w, "RELEASE")) {
                return TypeMask::UNKNOWN;
            }
        }
        if matches!(token, Some(Token::Word(w)) if eq(w, "RELEASE")) {
            token = lexer.next_token();
            work = true;
        }
    }

    match token {
        None | Some(Token::Symbol(b';')) => result,
        _ if work => TypeMask::UNKNOWN,
        _ if mask == TypeMask::ROLLBACK || mask == TypeMask::BEGIN_TRX => TypeMask::WRITE,
        _ => TypeMask::UNKNOWN,
    }
}

/// `START TRANSACTION [READ ONLY | READ WRITE | WITH CONSISTENT SNAPSHOT] [, ...]`
fn parse_start(lexer: &mut Lexer<'_>) -> TypeMask {
    match lexer.next_token() {
        Some(Token::Word(w)) if eq(w, "TRANSACTION") => {}
        _ => return TypeMask::WRITE,
    }

    let mut mask = TypeMask::BEGIN_TRX;
    loop {
        match lexer.next_token() {
            None | Some(Token::Symbol(b';')) => return mask,
            Some(Token::Symbol(b',')) => continue,
            Some(Token::Word(w)) if eq(w, "READ") => match lexer.next_token() {
                Some(Token::Word(w)) if eq(w, "ONLY") => mask |= TypeMask::READONLY,
                Some(Token::Word(w)) if eq(w, "WRITE") => mask |= TypeMask::READWRITE,
                _ => return TypeMask::UNKNOWN,
            },
            Some(Token::Word(w)) if eq(w, "WITH") => {
                let consistent =
                    matches!(lexer.next_token(), Some(Token::Word(w)) if eq(w, "CONSISTENT"));
                let snapshot =
                    matches!(lexer.next_token(), Some(Token::Word(w)) if eq(w, "SNAPSHOT"));
                if !(consistent && snapshot) {
                    return TypeMask::UNKNOWN;
                }
            }
            _ => return TypeMask::UNKNOWN,
        }
    }
}

/// `SET ...`: autocommit changes and transaction characteristics are
/// transaction boundaries; everything else is a session write, except global
/// variables which only need to reach the primary.
fn parse_set(lexer: &mut Lexer<'_>) -> (TypeMask, bool) {
    let mut token = lexer.next_token();

    // Scope qualifiers
    loop {
        match token {
            Some(Token::Word(w)) if eq(w, "GLOBAL") || eq(w, "PERSIST") => {
                return (TypeMask::GSYSVAR_WRITE, false);
            }
            Some(Token::Word(w)) if eq(w, "SESSION") || eq(w, "LOCAL") => {
                token = lexer.next_token();
            }
            Some(Token::Word(w)) if starts_with(w, "@@GLOBAL.") => {
                return (TypeMask::GSYSVAR_WRITE, false);
            }
            _ => break,
        }
    }

    let is_autocommit = match token {
        Some(Token::Word(w)) => {
            eq(w, "AUTOCOMMIT") || eq(w, "@@AUTOCOMMIT") || eq(w, "@@SESSION.AUTOCOMMIT")
                || eq(w, "@@LOCAL.AUTOCOMMIT")
        }
        _ => false,
    };

    if let Some(Token::Word(w)) = token {
        if eq(w, "TRANSACTION") {
            return (TypeMask::SESSION_WRITE | TypeMask::NEXT_TRX, true);
        }
    }

    if !is_autocommit {
        return (TypeMask::SESSION_WRITE, true);
    }

    if !matches!(lexer.next_token(), Some(Token::Symbol(b'='))) {
        return (TypeMask::SESSION_WRITE, true);
    }

    let mask = match lexer.next_token() {
        Some(Token::Word(w)) if eq(w, "1") || eq(w, "TRUE") || eq(w, "ON") => {
            TypeMask::SESSION_WRITE | TypeMask::COMMIT | TypeMask::ENABLE_AUTOCOMMIT
        }
        Some(Token::Word(w)) if eq(w, "0") || eq(w, "FALSE") || eq(w, "OFF") => {
            TypeMask::SESSION_WRITE | TypeMask::BEGIN_TRX | TypeMask::DISABLE_AUTOCOMMIT
        }
        _ => TypeMask::SESSION_WRITE,
    };
    (mask, true)
}

/// A `SELECT` reads, unless it locks rows or writes into variables/files.
fn parse_select(lexer: &mut Lexer<'_>) -> TypeMask {
    let mut mask = TypeMask::READ;
    let mut previous_for = false;

    while let Some(token) = lexer.next_token() {
        match token {
            Token::Symbol(b';') => break,
            Token::Word(w) if previous_for && (eq(w, "UPDATE") || eq(w, "SHARE")) => {
                mask |= TypeMask::WRITE;
            }
            Token::Word(w) if eq(w, "INTO") => mask |= TypeMask::WRITE,
            Token::Word(w) if starts_with(w, "@@") => mask |= TypeMask::SYSVAR_READ,
            Token::Word(w) if w.first() == Some(&b'@') => mask |= TypeMask::USERVAR_READ,
            Token::Word(w) if eq(w, "LAST_INSERT_ID") => mask |= TypeMask::MASTER_READ,
            _ => {}
        }
        previous_for = matches!(token, Token::Word(w) if eq(w, "FOR"));
    }

    mask
}

/// `LOAD DATA [LOW_PRIORITY|CONCURRENT] LOCAL INFILE`
fn is_load_data_local(lexer: &mut Lexer<'_>) -> bool {
    if !matches!(lexer.next_token(), Some(Token::Word(w)) if eq(w, "DATA")) {
        return false;
    }
    let mut token = lexer.next_token();
    if matches!(token, Some(Token::Word(w)) if eq(w, "LOW_PRIORITY") || eq(w, "CONCURRENT")) {
        token = lexer.next_token();
    }
    matches!(token, Some(Token::Word(w)) if eq(w, "LOCAL"))
        && matches!(lexer.next_token(), Some(Token::Word(w)) if eq(w, "INFILE"))
}

/// True if a `;` outside quotes and comments is followed by more SQL.
fn has_multiple_statements(sql: &[u8]) -> bool {
    let mut lexer = Lexer::new(sql);
    let mut seen_terminator = false;
    while let Some(token) = lexer.next_token() {
        match token {
            Token::Symbol(b';') => seen_terminator = true,
            _ if seen_terminator => return true,
            _ => {}
        }
    }
    false
}

#[inline]
fn eq(word: &[u8], keyword: &str) -> bool {
    word.eq_ignore_ascii_case(keyword.as_bytes())
}

#[inline]
fn starts_with(word: &[u8], prefix: &str) -> bool {
    word.len() >= prefix.len() && word[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token<'a> {
    /// Identifier, keyword, number or variable (`@x`, `@@session.x`)
    Word(&'a [u8]),
    /// Quoted string or identifier
    Quoted,
    Symbol(u8),
}

/// Minimal SQL tokenizer: skips whitespace, comments and quoted text.
struct Lexer<'a> {
    sql: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(sql: &'a [u8]) -> Self {
        Self { sql, pos: 0 }
    }

    fn peek(&self, offset: usize) -> Option<u8> {
        self.sql.get(self.pos + offset).copied()
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek(0) {
                Some(c) if c.is_ascii_whitespace() => self.pos += 1,
                Some(b'#') => self.skip_line(),
                Some(b'-') if self.peek(1) == Some(b'-') => {
                    // "-- " comment needs whitespace (or end) after the dashes
                    match self.peek(2) {
                        None => self.pos = self.sql.len(),
                        Some(c) if c.is_ascii_whitespace() => self.skip_line(),
                        _ => return,
                    }
                }
                Some(b'/') if self.peek(1) == Some(b'*') => {
                    self.pos += 2;
                    while self.pos < self.sql.len() {
                        if self.peek(0) == Some(b'*') && self.peek(1) == Some(b'/') {
                            self.pos += 2;
                            break;
                        }
                        self.pos += 1;
                    }
                    if self.pos > self.sql.len() {
                        self.pos = self.sql.len();
                    }
                }
                _ => return,
            }
        }
    }

    fn skip_line(&mut self) {
        while let Some(c) = self.peek(0) {
            self.pos += 1;
            if c == b'\n' {
                break;
            }
        }
    }

    fn skip_quoted(&mut self, quote: u8) {
        self.pos += 1;
        while let Some(c) = self.peek(0) {
            self.pos += 1;
            if c == b'\\' && quote != b'`' {
                self.pos += 1;
            } else if c == quote {
                if self.peek(0) == Some(quote) {
                    // Doubled quote is an escaped quote
                    self.pos += 1;
                } else {
                    break;
                }
            }
        }
        self.pos = self.pos.min(self.sql.len());
    }

    fn next_token(&mut self) -> Option<Token<'a>> {
        self.skip_trivia();
        let c = self.peek(0)?;

        if c == b'\'' || c == b'"' || c == b'`' {
            self.skip_quoted(c);
            return Some(Token::Quoted);
        }

        if is_word_byte(c) || c == b'@' {
            let start = self.pos;
            while let Some(c) = self.peek(0) {
                if is_word_byte(c) || c == b'@' || c == b'.' {
                    self.pos += 1;
                } else {
                    break;
                }
            }
            return Some(Token::Word(&self.sql[start..self.pos]));
        }

        self.pos += 1;
        Some(Token::Symbol(c))
    }
}

#[inline]
fn is_word_byte(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b'$' || c >= 0x80
}

//! Command parsing and analysis.
//!
//! A query line is split into tokens of `[A-Za-z0-9_-]`; any other byte is
//! rejected before it can reach the storage layer. The analyzer resolves
//! the (case-insensitive) command word and checks arity: fixed counts for
//! most commands, "even and non-zero" for MDEL.

use fq_core::command::CommandId;
use fq_core::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    command_id: CommandId,
    arguments: Vec<String>,
}

impl Query {
    pub fn command_id(&self) -> CommandId {
        self.command_id
    }

    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }
}

/// Expected argument count per command; `None` means "even pairs".
fn arguments_number(command_id: CommandId) -> Option<usize> {
    match command_id {
        CommandId::Incr | CommandId::Get | CommandId::Del | CommandId::Watch => Some(2),
        CommandId::MsgSize => Some(0),
        CommandId::MDel => None,
        CommandId::Unknown => Some(0),
    }
}

fn is_token_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-'
}

fn is_whitespace(byte: u8) -> bool {
    byte == b' ' || byte == b'\t' || byte == b'\n' || byte == b'\r'
}

pub fn parse_query(query: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();

    for &byte in query.as_bytes() {
        if is_whitespace(byte) {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            continue;
        }

        if !is_token_byte(byte) {
            return Err(Error::InvalidSymbol);
        }

        current.push(byte as char);
    }

    if !current.is_empty() {
        tokens.push(current);
    }

    Ok(tokens)
}

pub fn analyze_query(tokens: Vec<String>) -> Result<Query> {
    let Some((command, arguments)) = tokens.split_first() else {
        return Err(Error::InvalidCommand);
    };

    let command_id = CommandId::from_name(&command.to_ascii_uppercase());
    if command_id == CommandId::Unknown {
        return Err(Error::InvalidCommand);
    }

    match arguments_number(command_id) {
        Some(expected) if arguments.len() != expected => return Err(Error::InvalidArguments),
        None if arguments.is_empty() || arguments.len() % 2 != 0 => {
            return Err(Error::InvalidArguments)
        }
        _ => {}
    }

    Ok(Query {
        command_id,
        arguments: arguments.to_vec(),
    })
}

/// Parse and analyze one request line.
pub fn handle_query(query: &str) -> Result<Query> {
    analyze_query(parse_query(query)?)
}

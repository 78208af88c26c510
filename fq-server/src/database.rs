//! Request dispatcher.
//!
//! Bridges parsed queries to the storage facade and renders responses in
//! the text protocol: `ok|<payload>` or `err|<message>`. Validation errors
//! go back to the client without error-level logging; everything else is
//! logged.

use std::sync::Arc;

use tracing::{debug, error};

use fq_core::command::CommandId;
use fq_core::error::Error;
use fq_core::types::{BatchKey, Value};
use fq_storage::Storage;

use crate::compute;

pub struct Database {
    storage: Arc<Storage>,
    max_message_size: usize,
}

impl Database {
    pub fn new(storage: Arc<Storage>, max_message_size: usize) -> Self {
        Self {
            storage,
            max_message_size,
        }
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Execute one request line and render the response line.
    pub async fn handle_query(&self, query_str: &str) -> String {
        debug!(query = query_str, "handling query");

        if query_str.len() > self.max_message_size {
            return error_msg(&Error::MessageTooLarge {
                size: query_str.len(),
                max: self.max_message_size,
            });
        }

        let query = match compute::handle_query(query_str) {
            Ok(query) => query,
            Err(e) => return error_msg(&e),
        };

        match query.command_id() {
            CommandId::Incr => self.handle_incr(&query).await,
            CommandId::Get => self.handle_get(&query).await,
            CommandId::Del => self.handle_del(&query).await,
            CommandId::MDel => self.handle_mdel(&query).await,
            CommandId::Watch => self.handle_watch(&query).await,
            CommandId::MsgSize => value_msg(self.max_message_size as Value),
            CommandId::Unknown => {
                error!("compute layer produced an unknown command");
                error_msg(&Error::InternalConfiguration)
            }
        }
    }

    async fn handle_incr(&self, query: &compute::Query) -> String {
        let key = match batch_key(query.arguments()) {
            Ok(key) => key,
            Err(e) => return error_msg(&e),
        };

        match self.storage.incr(&key).await {
            Ok(value) => value_msg(value),
            Err(e) => logged_error_msg(&e),
        }
    }

    async fn handle_get(&self, query: &compute::Query) -> String {
        let key = match batch_key(query.arguments()) {
            Ok(key) => key,
            Err(e) => return error_msg(&e),
        };

        match self.storage.get(&key).await {
            Ok(value) => value_msg(value),
            Err(e) => logged_error_msg(&e),
        }
    }

    async fn handle_del(&self, query: &compute::Query) -> String {
        let key = match batch_key(query.arguments()) {
            Ok(key) => key,
            Err(e) => return error_msg(&e),
        };

        match self.storage.del(&key).await {
            Ok(removed) => bool_msg(removed),
            Err(e) => logged_error_msg(&e),
        }
    }

    async fn handle_mdel(&self, query: &compute::Query) -> String {
        let keys = match BatchKey::from_pairs(query.arguments()) {
            Ok(keys) => keys,
            Err(e) => return error_msg(&e),
        };

        match self.storage.mdel(&keys).await {
            Ok(results) => bools_msg(&results),
            Err(e) => logged_error_msg(&e),
        }
    }

    async fn handle_watch(&self, query: &compute::Query) -> String {
        let key = match batch_key(query.arguments()) {
            Ok(key) => key,
            Err(e) => return error_msg(&e),
        };

        match self.storage.watch(&key).await {
            Ok(value) => value_msg(value),
            Err(e) => logged_error_msg(&e),
        }
    }
}

fn batch_key(arguments: &[String]) -> fq_core::Result<BatchKey> {
    BatchKey::new(&arguments[0], &arguments[1])
}

fn error_msg(error: &Error) -> String {
    format!("err|{error}")
}

fn logged_error_msg(error: &Error) -> String {
    if !error.is_validation() {
        error!(error = %error, "query failed");
    }
    error_msg(error)
}

fn value_msg(value: Value) -> String {
    format!("ok|{}", value as u64)
}

fn bool_msg(value: bool) -> String {
    if value {
        "ok|1".to_string()
    } else {
        "ok|0".to_string()
    }
}

fn bools_msg(values: &[bool]) -> String {
    let mut msg = String::with_capacity(values.len() * 2 + 3);
    msg.push_str("ok|");

    for (i, value) in values.iter().enumerate() {
        msg.push(if *value { '1' } else { '0' });
        if i < values.len() - 1 {
            msg.push(';');
        }
    }

    msg
}

//! Tasks that can run in a worker process.
//!
//! Closures cannot cross a process boundary, so process pools run *named*
//! tasks instead. A [`RemoteTask`] is a type with a stable name, serde-friendly
//! input and output, and a plain function body. The parent sends the name and
//! the encoded item; the child looks the name up in its [`TaskTable`] and runs
//! the same code.
//!
//! ```
//! use fanout::{BoxError, RemoteTask, TaskTable};
//!
//! struct WordCount;
//!
//! impl RemoteTask for WordCount {
//!     const NAME: &'static str = "word_count";
//!     type Item = String;
//!     type Output = usize;
//!
//!     fn run(text: String) -> Result<usize, BoxError> {
//!         Ok(text.split_whitespace().count())
//!     }
//! }
//!
//! let mut tasks = TaskTable::new();
//! tasks.register::<WordCount>();
//! assert!(tasks.contains("word_count"));
//! ```

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{BoxError, TaskError};

pub trait RemoteTask: 'static {
    /// Identifies the task across processes. Must be unique per binary.
    const NAME: &'static str;
    type Item: Serialize + DeserializeOwned + Send + 'static;
    type Output: Serialize + DeserializeOwned + Send + 'static;

    fn run(item: Self::Item) -> Result<Self::Output, BoxError>;
}

type Invoke = fn(Value) -> Result<Value, TaskError>;

/// The remote tasks a worker process knows how to run.
#[derive(Debug, Clone, Default)]
pub struct TaskTable {
    tasks: BTreeMap<&'static str, Invoke>,
}

impl TaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<K: RemoteTask>(&mut self) -> &mut Self {
        if self.tasks.insert(K::NAME, invoke::<K>).is_some() {
            tracing::warn!(task = K::NAME, "Remote task registered twice, keeping the last one");
        }
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Registered task names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        self.tasks.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Decodes `payload`, runs the named task and encodes its output.
    pub fn run(&self, name: &str, payload: Value) -> Result<Value, TaskError> {
        let invoke = self
            .tasks
            .get(name)
            .ok_or_else(|| TaskError::Remote(format!("unknown task {name:?}")))?;
        invoke(payload)
    }
}

fn invoke<K: RemoteTask>(payload: Value) -> Result<Value, TaskError> {
    let item = decode::<K::Item>(payload)?;
    let output = K::run(item).map_err(TaskError::Failed)?;
    encode(&output)
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Value, TaskError> {
    serde_json::to_value(value).map_err(|e| TaskError::Codec(e.to_string()))
}

pub(crate) fn decode<T: DeserializeOwned>(value: Value) -> Result<T, TaskError> {
    serde_json::from_value(value).map_err(|e| TaskError::Codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Halve;

    impl RemoteTask for Halve {
        const NAME: &'static str = "halve";
        type Item = u32;
        type Output = u32;

        fn run(n: u32) -> Result<u32, BoxError> {
            if n % 2 == 1 {
                return Err(format!("{n} is odd").into());
            }
            Ok(n / 2)
        }
    }

    struct Shout;

    impl RemoteTask for Shout {
        const NAME: &'static str = "shout";
        type Item = String;
        type Output = String;

        fn run(s: String) -> Result<String, BoxError> {
            Ok(s.to_uppercase())
        }
    }

    fn table() -> TaskTable {
        let mut table = TaskTable::new();
        table.register::<Shout>().register::<Halve>();
        table
    }

    #[test]
    fn runs_registered_tasks() {
        let table = table();
        assert_eq!(table.run("halve", json!(8)).unwrap(), json!(4));
        assert_eq!(table.run("shout", json!("hey")).unwrap(), json!("HEY"));
        assert_eq!(table.names(), vec!["halve", "shout"]);
    }

    #[test]
    fn task_errors_are_failures() {
        let err = table().run("halve", json!(3)).unwrap_err();
        assert!(matches!(&err, TaskError::Failed(_)));
        assert_eq!(err.to_string(), "3 is odd");
    }

    #[test]
    fn bad_payloads_are_codec_errors() {
        let err = table().run("halve", json!("eight")).unwrap_err();
        assert!(matches!(err, TaskError::Codec(_)));
    }

    #[test]
    fn unknown_tasks_are_remote_errors() {
        assert!(!table().contains("double"));
        let err = table().run("double", json!(1)).unwrap_err();
        assert!(matches!(err, TaskError::Remote(msg) if msg.contains("double")));
    }
}

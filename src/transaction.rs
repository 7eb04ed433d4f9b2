//! Transaction modes used by the query layer.
//!
//! Queries never run inside caller-visible transactions. Two internal ones exist:
//! - a read-only snapshot around a paginated page and its found-rows side query, so both
//!   see the same data;
//! - a read-only transaction holding a server-side cursor open while a stream is consumed.

/// Transaction isolation level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    /// Read committed (PostgreSQL default)
    ReadCommitted,
    /// Repeatable read: one snapshot for every statement of the transaction
    RepeatableRead,
    /// Serializable
    Serializable,
}

impl IsolationLevel {
    fn to_sql(self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

/// How an internal transaction is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionMode {
    pub isolation: IsolationLevel,
    pub access: AccessMode,
}

impl TransactionMode {
    /// Page plus found-rows count.
    pub const SNAPSHOT: TransactionMode = TransactionMode {
        isolation: IsolationLevel::RepeatableRead,
        access: AccessMode::ReadOnly,
    };

    /// Server-side cursor for streaming.
    pub const CURSOR: TransactionMode = TransactionMode {
        isolation: IsolationLevel::ReadCommitted,
        access: AccessMode::ReadOnly,
    };

    pub fn begin_sql(self) -> String {
        let access = match self.access {
            AccessMode::ReadOnly => "READ ONLY",
            AccessMode::ReadWrite => "READ WRITE",
        };
        format!("BEGIN ISOLATION LEVEL {}, {access}", self.isolation.to_sql())
    }
}

pub const COMMIT: &str = "COMMIT";
pub const ROLLBACK: &str = "ROLLBACK";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_sql() {
        assert_eq!(
            TransactionMode::SNAPSHOT.begin_sql(),
            "BEGIN ISOLATION LEVEL REPEATABLE READ, READ ONLY"
        );
        assert_eq!(
            TransactionMode::CURSOR.begin_sql(),
            "BEGIN ISOLATION LEVEL READ COMMITTED, READ ONLY"
        );
        let writer = TransactionMode {
            isolation: IsolationLevel::Serializable,
            access: AccessMode::ReadWrite,
        };
        assert_eq!(writer.begin_sql(), "BEGIN ISOLATION LEVEL SERIALIZABLE, READ WRITE");
    }
}

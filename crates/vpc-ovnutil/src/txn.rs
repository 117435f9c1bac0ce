//! Multi-statement `ovn-nbctl` transactions.
//!
//! Every command is prefixed with `--`, so the whole transaction runs as one
//! `ovn-nbctl -- cmd1 -- cmd2 ...` invocation and commits atomically.

use crate::schema::Row;
use crate::value::{quote, Atom, Uuid};

/// Builder for one atomic northbound transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transaction {
    args: Vec<String>,
    commands: usize,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if no command has been added.
    pub fn is_empty(&self) -> bool {
        self.commands == 0
    }

    /// Number of commands in the transaction.
    pub fn len(&self) -> usize {
        self.commands
    }

    /// The rendered argument vector.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    fn push<I, S>(&mut self, words: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.push("--".to_string());
        self.args.extend(words.into_iter().map(Into::into));
        self.commands += 1;
    }

    /// `--id=@<id> create <table> <columns...>`; returns the symbolic reference.
    pub fn create<R: Row>(&mut self, row: &R, id: &str) -> Uuid {
        let mut words = vec![
            format!("--id=@{}", id),
            "create".to_string(),
            R::TABLE.to_string(),
        ];
        words.extend(row.to_args());
        self.push(words);
        Uuid::named(id)
    }

    /// `set <table> <record> <tokens...>`.
    pub fn set(&mut self, table: &str, record: &str, tokens: Vec<String>) {
        if tokens.is_empty() {
            return;
        }
        let mut words = vec!["set".to_string(), table.to_string(), record.to_string()];
        words.extend(tokens);
        self.push(words);
    }

    /// `set <table> <record> external_ids:<key>=<value>`.
    pub fn set_external_id(&mut self, table: &str, record: &str, key: &str, value: &str) {
        self.set(
            table,
            record,
            vec![format!("external_ids:{}={}", key, quote(value))],
        );
    }

    /// `add <table> <record> <column> <values...>`.
    pub fn add<A: Atom>(&mut self, table: &str, record: &str, column: &str, values: &[A]) {
        if values.is_empty() {
            return;
        }
        let mut words = vec![
            "add".to_string(),
            table.to_string(),
            record.to_string(),
            column.to_string(),
        ];
        words.extend(values.iter().map(Atom::to_arg));
        self.push(words);
    }

    /// `remove <table> <record> <column> <values...>`.
    pub fn remove<A: Atom>(&mut self, table: &str, record: &str, column: &str, values: &[A]) {
        if values.is_empty() {
            return;
        }
        let mut words = vec![
            "remove".to_string(),
            table.to_string(),
            record.to_string(),
            column.to_string(),
        ];
        words.extend(values.iter().map(Atom::to_arg));
        self.push(words);
    }

    /// `--if-exists destroy <table> <record>`.
    pub fn destroy(&mut self, table: &str, record: &str) {
        self.push(["--if-exists", "destroy", table, record]);
    }

    /// `--if-exists lsp-del <port>`.
    pub fn lsp_del(&mut self, port: &str) {
        self.push(["--if-exists", "lsp-del", port]);
    }

    /// `--if-exists lrp-del <port>`.
    pub fn lrp_del(&mut self, port: &str) {
        self.push(["--if-exists", "lrp-del", port]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::LogicalRouter;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_create_renders_named_id() {
        let mut txn = Transaction::new();
        let lr = LogicalRouter {
            name: "vpc-r-v1".to_string(),
            ..Default::default()
        };
        let id = txn.create(&lr, "lr");
        assert_eq!(id, Uuid::named("lr"));
        assert_eq!(
            txn.args(),
            &["--", "--id=@lr", "create", "Logical_Router", r#"name="vpc-r-v1""#]
        );
    }

    #[test]
    fn test_multi_statement() {
        let mut txn = Transaction::new();
        txn.add("Logical_Router", "vpc-r-v1", "ports", &[Uuid::named("lrp")]);
        txn.lsp_del("vpc-h-v1");
        txn.destroy("DNS", "u1");
        assert_eq!(txn.len(), 3);
        assert_eq!(
            txn.args(),
            &[
                "--", "add", "Logical_Router", "vpc-r-v1", "ports", "@lrp",
                "--", "--if-exists", "lsp-del", "vpc-h-v1",
                "--", "--if-exists", "destroy", "DNS", "u1",
            ]
        );
    }

    #[test]
    fn test_empty_values_are_skipped() {
        let mut txn = Transaction::new();
        txn.add::<Uuid>("Logical_Switch", "ls", "acls", &[]);
        txn.set("ACL", "u1", Vec::new());
        assert!(txn.is_empty());
    }

    #[test]
    fn test_set_external_id_quotes_value() {
        let mut txn = Transaction::new();
        txn.set_external_id("ACL", "u1", "oc-version", "2020-01-01T00:00:00Z.3");
        assert_eq!(
            txn.args().last().map(String::as_str),
            Some(r#"external_ids:oc-version="2020-01-01T00:00:00Z.3""#)
        );
    }
}

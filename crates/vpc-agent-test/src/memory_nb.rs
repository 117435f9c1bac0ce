//! In-memory northbound database.
//!
//! Executes the same `--`-separated command vectors the agent hands to
//! `ovn-nbctl`, with the OVSDB behaviour the agent relies on:
//!
//! - a transaction applies atomically or not at all
//! - `@name` references resolve to the rows created in the transaction
//! - references to destroyed rows are dropped
//! - unreferenced non-root rows are garbage-collected
//! - switch and router port names stay unique

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use vpc_ovnutil::schema::{to_listing, visit_table, TABLES};
use vpc_ovnutil::{
    LogicalRouter, LogicalRouterPort, LogicalSwitch, LogicalSwitchPort, NbDatabase, OvnError,
    OvnNorthbound, OvnResult, Row, TableVisitor, Transaction, Uuid,
};

/// One command of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Leading `--option` words, e.g. `--id=@row1` or `--if-exists`.
    pub options: Vec<String>,
    pub verb: String,
    pub args: Vec<String>,
}

impl Command {
    fn from_words(words: Vec<String>) -> Option<Self> {
        let split = words.iter().position(|w| !w.starts_with("--"))?;
        let mut rest = words[split..].to_vec();
        let verb = rest.remove(0);
        Some(Self {
            options: words[..split].to_vec(),
            verb,
            args: rest,
        })
    }

    fn has_option(&self, option: &str) -> bool {
        self.options.iter().any(|o| o == option)
    }

    fn named_id(&self) -> Option<&str> {
        self.options.iter().find_map(|o| o.strip_prefix("--id="))
    }

    fn arg(&self, index: usize) -> Result<&str, String> {
        self.args
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| format!("{}: missing argument {}", self.verb, index))
    }
}

/// Splits a rendered transaction into its commands.
pub fn parse_commands(args: &[String]) -> Vec<Command> {
    let mut commands = Vec::new();
    let mut current: Option<Vec<String>> = None;
    for arg in args {
        if arg == "--" {
            if let Some(words) = current.take() {
                commands.extend(Command::from_words(words));
            }
            current = Some(Vec::new());
        } else {
            current.get_or_insert_with(Vec::new).push(arg.clone());
        }
    }
    if let Some(words) = current {
        commands.extend(Command::from_words(words));
    }
    commands
}

#[derive(Debug, Default)]
struct State {
    nb: OvnNorthbound,
    next_uuid: u64,
    transactions: Vec<Vec<Command>>,
    lists: usize,
    fail_next: Option<String>,
}

/// Shared in-memory northbound database; clones see the same rows.
#[derive(Debug, Clone, Default)]
pub struct MemoryNorthbound {
    state: Arc<Mutex<State>>,
}

impl MemoryNorthbound {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of every table.
    pub fn snapshot(&self) -> OvnNorthbound {
        self.lock().nb.clone()
    }

    /// Rows of one table.
    pub fn rows<R: Row>(&self) -> Vec<R> {
        R::table(&self.lock().nb).clone()
    }

    /// Row with the given indexed name.
    pub fn get_by_name<R: Row>(&self, name: &str) -> Option<R> {
        self.lock().nb.get_by_name::<R>(name).cloned()
    }

    /// Seeds a row outside any transaction; an empty UUID gets a fresh one.
    pub fn insert<R: Row>(&self, mut row: R) -> Uuid {
        let mut state = self.lock();
        if row.uuid().is_empty() {
            let uuid = fresh_uuid(&mut state.next_uuid);
            row.set_uuid(uuid);
        }
        let uuid = row.uuid().clone();
        R::table_mut(&mut state.nb).push(row);
        uuid
    }

    /// Every committed transaction, oldest first.
    pub fn transactions(&self) -> Vec<Vec<Command>> {
        self.lock().transactions.clone()
    }

    pub fn transaction_count(&self) -> usize {
        self.lock().transactions.len()
    }

    /// Number of committed commands with the given verb.
    pub fn command_count(&self, verb: &str) -> usize {
        self.lock()
            .transactions
            .iter()
            .flatten()
            .filter(|c| c.verb == verb)
            .count()
    }

    /// Number of table listings served.
    pub fn list_count(&self) -> usize {
        self.lock().lists
    }

    /// Forgets the transaction log and listing count.
    pub fn clear_log(&self) {
        let mut state = self.lock();
        state.transactions.clear();
        state.lists = 0;
    }

    /// Makes the next transaction fail with `message` without applying it.
    pub fn fail_next_transaction(&self, message: impl Into<String>) {
        self.lock().fail_next = Some(message.into());
    }
}

#[async_trait]
impl NbDatabase for MemoryNorthbound {
    async fn list(&self, table: &str, columns: &[&str]) -> OvnResult<String> {
        let mut state = self.lock();
        state.lists += 1;
        visit_table(
            table,
            Listing {
                nb: &state.nb,
                columns,
            },
        )
        .map(|doc| doc.to_string())
        .ok_or_else(|| OvnError::Listing {
            table: table.to_string(),
            message: "no such table".to_string(),
        })
    }

    async fn transact(&self, txn: &Transaction) -> OvnResult<()> {
        if txn.is_empty() {
            return Ok(());
        }
        let mut state = self.lock();
        if let Some(message) = state.fail_next.take() {
            return Err(failed(message));
        }
        let commands = parse_commands(txn.args());
        let mut nb = state.nb.clone();
        let mut next_uuid = state.next_uuid;
        apply(&mut nb, &mut next_uuid, &commands).map_err(failed)?;
        state.nb = nb;
        state.next_uuid = next_uuid;
        state.transactions.push(commands);
        Ok(())
    }
}

fn failed(message: String) -> OvnError {
    OvnError::CommandFailed {
        command: "ovn-nbctl transaction".to_string(),
        exit_code: 1,
        output: message,
    }
}

fn fresh_uuid(next: &mut u64) -> Uuid {
    *next += 1;
    Uuid::new(format!("{:08x}-0000-4000-8000-{:012x}", *next, *next))
}

fn apply(nb: &mut OvnNorthbound, next_uuid: &mut u64, commands: &[Command]) -> Result<(), String> {
    let mut named: HashMap<Uuid, Uuid> = HashMap::new();
    for command in commands {
        apply_command(nb, next_uuid, &mut named, command)?;
    }
    for table in TABLES {
        visit_table(
            table,
            ResolveNamed {
                nb: &mut *nb,
                named: &named,
            },
        )
        .unwrap_or(Ok(()))?;
    }
    collect_garbage(nb)?;
    unique_names::<LogicalSwitchPort>(nb)?;
    unique_names::<LogicalRouterPort>(nb)?;
    Ok(())
}

fn apply_command(
    nb: &mut OvnNorthbound,
    next_uuid: &mut u64,
    named: &mut HashMap<Uuid, Uuid>,
    command: &Command,
) -> Result<(), String> {
    let if_exists = command.has_option("--if-exists");
    match command.verb.as_str() {
        "create" => {
            let table = command.arg(0)?;
            let uuid = fresh_uuid(next_uuid);
            if let Some(id) = command.named_id() {
                named.insert(Uuid::new(id), uuid.clone());
            }
            visit_table(
                table,
                Create {
                    nb,
                    uuid,
                    tokens: &command.args[1..],
                },
            )
            .ok_or_else(|| format!("no table {}", table))?
        }
        "set" | "add" | "remove" | "destroy" => {
            let table = command.arg(0)?;
            let record = command.arg(1)?;
            let op = match command.verb.as_str() {
                "set" => Op::Set(&command.args[2..]),
                "add" => Op::Add(command.arg(2)?, &command.args[3..]),
                "remove" => Op::Remove(command.arg(2)?, &command.args[3..]),
                _ => Op::Destroy,
            };
            let found = visit_table(
                table,
                Update {
                    nb,
                    named,
                    record,
                    op,
                },
            )
            .ok_or_else(|| format!("no table {}", table))??;
            if found || (if_exists && command.verb == "destroy") {
                Ok(())
            } else {
                Err(format!("no row \"{}\" in table {}", record, table))
            }
        }
        "lsp-del" => {
            let found = delete_port::<LogicalSwitchPort, LogicalSwitch>(
                nb,
                named,
                command.arg(0)?,
                switch_ports,
            );
            if found || if_exists {
                Ok(())
            } else {
                Err(format!("{}: switch port name not found", command.arg(0)?))
            }
        }
        "lrp-del" => {
            let found = delete_port::<LogicalRouterPort, LogicalRouter>(
                nb,
                named,
                command.arg(0)?,
                router_ports,
            );
            if found || if_exists {
                Ok(())
            } else {
                Err(format!("{}: router port name not found", command.arg(0)?))
            }
        }
        verb => Err(format!("unsupported command {}", verb)),
    }
}

/// Index of the row named by `record`: an `@name` created in this
/// transaction, a UUID, or an indexed name.
fn find_row<R: Row>(nb: &OvnNorthbound, named: &HashMap<Uuid, Uuid>, record: &str) -> Option<usize> {
    let record = record.trim_matches('"');
    let rows = R::table(nb);
    if record.starts_with('@') {
        let uuid = named.get(&Uuid::new(record))?;
        return rows.iter().position(|r| r.uuid() == uuid);
    }
    rows.iter()
        .position(|r| r.uuid().as_str() == record)
        .or_else(|| rows.iter().position(|r| r.index_name() == Some(record)))
}

fn switch_ports(ls: &mut LogicalSwitch) -> &mut Vec<Uuid> {
    &mut ls.ports
}

fn router_ports(lr: &mut LogicalRouter) -> &mut Vec<Uuid> {
    &mut lr.ports
}

fn delete_port<R: Row, P: Row>(
    nb: &mut OvnNorthbound,
    named: &HashMap<Uuid, Uuid>,
    record: &str,
    ports: fn(&mut P) -> &mut Vec<Uuid>,
) -> bool {
    let Some(index) = find_row::<R>(nb, named, record) else {
        return false;
    };
    let port = R::table_mut(nb).remove(index);
    for parent in P::table_mut(nb) {
        ports(parent).retain(|u| u != port.uuid());
    }
    true
}

struct Listing<'a> {
    nb: &'a OvnNorthbound,
    columns: &'a [&'a str],
}

impl TableVisitor for Listing<'_> {
    type Output = Value;

    fn visit<R: Row>(self) -> Value {
        to_listing(R::table(self.nb), self.columns)
    }
}

struct Create<'a> {
    nb: &'a mut OvnNorthbound,
    uuid: Uuid,
    tokens: &'a [String],
}

impl TableVisitor for Create<'_> {
    type Output = Result<(), String>;

    fn visit<R: Row>(self) -> Self::Output {
        let mut row = R::default();
        for token in self.tokens {
            row.apply_arg(token)
                .map_err(|e| format!("{} create: {}", R::TABLE, e))?;
        }
        row.set_uuid(self.uuid);
        R::table_mut(self.nb).push(row);
        Ok(())
    }
}

enum Op<'a> {
    Set(&'a [String]),
    Add(&'a str, &'a [String]),
    Remove(&'a str, &'a [String]),
    Destroy,
}

struct Update<'a> {
    nb: &'a mut OvnNorthbound,
    named: &'a HashMap<Uuid, Uuid>,
    record: &'a str,
    op: Op<'a>,
}

impl TableVisitor for Update<'_> {
    /// Whether the record was found.
    type Output = Result<bool, String>;

    fn visit<R: Row>(self) -> Self::Output {
        let Some(index) = find_row::<R>(self.nb, self.named, self.record) else {
            return Ok(false);
        };
        let rows = R::table_mut(self.nb);
        let fail = |e: vpc_ovnutil::ValueError| format!("{} {}: {}", R::TABLE, self.record, e);
        match self.op {
            Op::Set(tokens) => {
                for token in tokens {
                    rows[index].apply_arg(token).map_err(fail)?;
                }
            }
            Op::Add(column, values) => {
                for value in values {
                    rows[index].add_value(column, value).map_err(fail)?;
                }
            }
            Op::Remove(column, values) => {
                for value in values {
                    rows[index].remove_value(column, value).map_err(fail)?;
                }
            }
            Op::Destroy => {
                rows.remove(index);
            }
        }
        Ok(true)
    }
}

struct ResolveNamed<'a> {
    nb: &'a mut OvnNorthbound,
    named: &'a HashMap<Uuid, Uuid>,
}

impl TableVisitor for ResolveNamed<'_> {
    type Output = Result<(), String>;

    fn visit<R: Row>(self) -> Self::Output {
        for row in R::table_mut(self.nb) {
            for reference in row.references_mut() {
                if !reference.is_named() {
                    continue;
                }
                let resolved = self
                    .named
                    .get(&*reference)
                    .ok_or_else(|| format!("{}: unknown row {}", R::TABLE, reference))?;
                *reference = resolved.clone();
            }
        }
        Ok(())
    }
}

struct CollectUuids<'a> {
    nb: &'a OvnNorthbound,
    live: &'a mut HashSet<Uuid>,
    referenced: &'a mut HashSet<Uuid>,
}

impl TableVisitor for CollectUuids<'_> {
    type Output = ();

    fn visit<R: Row>(self) {
        for row in R::table(self.nb) {
            self.live.insert(row.uuid().clone());
            self.referenced.extend(row.references().into_iter().cloned());
        }
    }
}

/// Drops references to rows that no longer exist.
struct PruneDangling<'a> {
    nb: &'a mut OvnNorthbound,
    live: &'a HashSet<Uuid>,
}

impl TableVisitor for PruneDangling<'_> {
    type Output = Result<(), String>;

    fn visit<R: Row>(self) -> Self::Output {
        for row in R::table_mut(self.nb) {
            for column in R::COLUMNS {
                let Some(value) = row.column(column) else {
                    continue;
                };
                let pruned = prune_value(&value, self.live);
                if pruned != value {
                    row.set_column(column, &pruned)
                        .map_err(|e| format!("{}.{}: {}", R::TABLE, column, e))?;
                }
            }
        }
        Ok(())
    }
}

fn is_dead(atom: &Value, live: &HashSet<Uuid>) -> bool {
    match atom.as_array().map(Vec::as_slice) {
        Some([tag, Value::String(id)]) if tag == "uuid" => !live.contains(&Uuid::new(id.as_str())),
        _ => false,
    }
}

fn prune_value(value: &Value, live: &HashSet<Uuid>) -> Value {
    if is_dead(value, live) {
        return json!(["set", []]);
    }
    match value.as_array().map(Vec::as_slice) {
        Some([tag, Value::Array(items)]) if tag == "set" => {
            let kept: Vec<Value> = items.iter().filter(|i| !is_dead(i, live)).cloned().collect();
            json!(["set", kept])
        }
        _ => value.clone(),
    }
}

/// Removes unreferenced non-root rows.
struct Collect<'a> {
    nb: &'a mut OvnNorthbound,
    referenced: &'a HashSet<Uuid>,
}

impl TableVisitor for Collect<'_> {
    type Output = usize;

    fn visit<R: Row>(self) -> usize {
        if R::IS_ROOT {
            return 0;
        }
        let rows = R::table_mut(self.nb);
        let before = rows.len();
        rows.retain(|r| self.referenced.contains(r.uuid()));
        before - rows.len()
    }
}

fn collect_garbage(nb: &mut OvnNorthbound) -> Result<(), String> {
    loop {
        let mut live = HashSet::new();
        let mut referenced = HashSet::new();
        for table in TABLES {
            visit_table(
                table,
                CollectUuids {
                    nb: &*nb,
                    live: &mut live,
                    referenced: &mut referenced,
                },
            );
        }
        for table in TABLES {
            visit_table(
                table,
                PruneDangling {
                    nb: &mut *nb,
                    live: &live,
                },
            )
            .unwrap_or(Ok(()))?;
        }
        let mut removed = 0;
        for table in TABLES {
            removed += visit_table(
                table,
                Collect {
                    nb: &mut *nb,
                    referenced: &referenced,
                },
            )
            .unwrap_or(0);
        }
        if removed == 0 {
            return Ok(());
        }
    }
}

fn unique_names<R: Row>(nb: &OvnNorthbound) -> Result<(), String> {
    let mut seen = HashSet::new();
    for row in R::table(nb) {
        if let Some(name) = row.index_name() {
            if !seen.insert(name) {
                return Err(format!(
                    "transaction causes multiple rows in \"{}\" table to have identical values ({}) for index on column \"name\"",
                    R::TABLE,
                    name
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vpc_ovnutil::Acl;

    fn router(name: &str) -> LogicalRouter {
        LogicalRouter {
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_commands() {
        let mut txn = Transaction::new();
        txn.create(&router("r1"), "row1");
        txn.lsp_del("p1");
        let commands = parse_commands(txn.args());
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].verb, "create");
        assert_eq!(commands[0].named_id(), Some("@row1"));
        assert_eq!(commands[1].verb, "lsp-del");
        assert!(commands[1].has_option("--if-exists"));
        assert_eq!(commands[1].args, vec!["p1".to_string()]);
    }

    #[tokio::test]
    async fn test_create_resolves_named_references() {
        let nb = MemoryNorthbound::new();
        let mut txn = Transaction::new();
        let lrp = txn.create(
            &LogicalRouterPort {
                name: "lrp1".to_string(),
                mac: "0a:00:00:00:00:01".to_string(),
                ..Default::default()
            },
            "row1",
        );
        txn.create(
            &LogicalRouter {
                name: "r1".to_string(),
                ports: vec![lrp],
                ..Default::default()
            },
            "row2",
        );
        nb.transact(&txn).await.unwrap();

        let lr = nb.get_by_name::<LogicalRouter>("r1").unwrap();
        let lrp = nb.get_by_name::<LogicalRouterPort>("lrp1").unwrap();
        assert_eq!(lr.ports, vec![lrp.uuid.clone()]);
        assert!(!lrp.uuid.is_named());
    }

    #[tokio::test]
    async fn test_unreferenced_child_is_collected() {
        let nb = MemoryNorthbound::new();
        let mut txn = Transaction::new();
        txn.create(&Acl::default(), "row1");
        nb.transact(&txn).await.unwrap();
        assert!(nb.rows::<Acl>().is_empty());
    }

    #[tokio::test]
    async fn test_failed_transaction_changes_nothing() {
        let nb = MemoryNorthbound::new();
        let mut txn = Transaction::new();
        txn.create(&router("r1"), "row1");
        txn.add("Logical_Router", "missing", "ports", &[Uuid::new("x")]);
        assert!(nb.transact(&txn).await.is_err());
        assert!(nb.rows::<LogicalRouter>().is_empty());
        assert_eq!(nb.transaction_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_port_name_rejected() {
        let nb = MemoryNorthbound::new();
        let port = LogicalSwitchPort {
            name: "p1".to_string(),
            ..Default::default()
        };
        let mut txn = Transaction::new();
        let a = txn.create(&port, "row1");
        let b = txn.create(&port, "row2");
        txn.create(
            &LogicalSwitch {
                name: "s1".to_string(),
                ports: vec![a, b],
                ..Default::default()
            },
            "row3",
        );
        assert!(nb.transact(&txn).await.is_err());
    }

    #[tokio::test]
    async fn test_lsp_del_detaches_from_switch() {
        let nb = MemoryNorthbound::new();
        let mut txn = Transaction::new();
        let port = txn.create(
            &LogicalSwitchPort {
                name: "p1".to_string(),
                ..Default::default()
            },
            "row1",
        );
        txn.create(
            &LogicalSwitch {
                name: "s1".to_string(),
                ports: vec![port],
                ..Default::default()
            },
            "row2",
        );
        nb.transact(&txn).await.unwrap();

        let mut del = Transaction::new();
        del.lsp_del("p1");
        del.lsp_del("p-missing");
        nb.transact(&del).await.unwrap();
        assert!(nb.rows::<LogicalSwitchPort>().is_empty());
        assert!(nb.get_by_name::<LogicalSwitch>("s1").unwrap().ports.is_empty());
        assert_eq!(nb.command_count("lsp-del"), 2);
    }

    #[tokio::test]
    async fn test_listing_round_trips_through_dump() {
        let nb = MemoryNorthbound::new();
        nb.insert(router("r1"));
        let dump = OvnNorthbound::dump(&nb).await.unwrap();
        assert_eq!(dump.logical_router.len(), 1);
        assert_eq!(dump.logical_router[0].name, "r1");
        assert_eq!(nb.list_count(), TABLES.len());
    }

    #[tokio::test]
    async fn test_fail_next_transaction() {
        let nb = MemoryNorthbound::new();
        nb.fail_next_transaction("connection refused");
        let mut txn = Transaction::new();
        txn.create(&router("r1"), "row1");
        assert!(nb.transact(&txn).await.is_err());
        nb.transact(&txn).await.unwrap();
        assert_eq!(nb.rows::<LogicalRouter>().len(), 1);
    }
}

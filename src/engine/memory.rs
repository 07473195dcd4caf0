//! In-memory reference engine.
//!
//! Holds JSON documents per collection and evaluates the IR subset the
//! builder emits. It exists so the crate's tests and demos run hermetically
//! against a real [`QueryEngine`] implementation, change notifications
//! included. Full-text `MATCH` and `REGEXP_LIKE()` are rejected at compile
//! time the way a constrained engine build would reject them.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value as Json};
use tracing::debug;

use super::{
    ChangeHook, CompiledQuery, EngineError, EngineResult, ErrorDomain, ObserverGuard, QueryEngine,
    RowEnumerator,
};

const ERR_BAD_QUERY: i32 = 23;
const ERR_UNSUPPORTED: i32 = 30;

/// An engine keeping all documents in memory.
#[derive(Clone, Default)]
pub struct MemoryEngine {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    collections: Mutex<BTreeMap<String, Vec<Json>>>,
    next_sequence: AtomicU64,
    hooks: Mutex<BTreeMap<u64, HookEntry>>,
    next_hook: AtomicU64,
}

struct HookEntry {
    hook: ChangeHook,
    enabled: Arc<AtomicBool>,
}

impl MemoryEngine {
    /// An empty engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a document, assigning `_sequence` and, if absent, `_id`.
    /// Fires change hooks.
    pub fn insert(&self, collection: &str, mut doc: Json) {
        let seq = self.shared.next_sequence.fetch_add(1, Ordering::SeqCst) + 1;
        if let Json::Object(fields) = &mut doc {
            fields.insert("_sequence".into(), json!(seq));
            fields
                .entry("_id")
                .or_insert_with(|| json!(format!("doc-{seq}")));
        }
        self.shared
            .collections
            .lock()
            .entry(collection.to_owned())
            .or_default()
            .push(doc);
        self.notify();
    }

    /// Removes the document with the given `_id`. Fires change hooks when a
    /// document was actually removed.
    pub fn remove(&self, collection: &str, id: &str) -> bool {
        let removed = {
            let mut collections = self.shared.collections.lock();
            match collections.get_mut(collection) {
                Some(docs) => {
                    let before = docs.len();
                    docs.retain(|d| d.get("_id").and_then(Json::as_str) != Some(id));
                    docs.len() < before
                }
                None => false,
            }
        };
        if removed {
            self.notify();
        }
        removed
    }

    /// Number of change observers currently registered.
    pub fn observer_count(&self) -> usize {
        self.shared.hooks.lock().len()
    }

    /// Number of documents currently in a collection.
    pub fn count(&self, collection: &str) -> usize {
        self.shared
            .collections
            .lock()
            .get(collection)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn notify(&self) {
        let hooks: Vec<ChangeHook> = self
            .shared
            .hooks
            .lock()
            .values()
            .filter(|entry| entry.enabled.load(Ordering::SeqCst))
            .map(|entry| entry.hook.clone())
            .collect();
        for hook in hooks {
            hook();
        }
    }
}

impl QueryEngine for MemoryEngine {
    fn compile(&self, ir: &Json) -> EngineResult<Arc<dyn CompiledQuery>> {
        let plan = Plan::parse(ir)?;
        debug!(collection = %plan.from.collection, "compiled in-memory query");
        Ok(Arc::new(MemoryQuery {
            shared: self.shared.clone(),
            columns: plan.column_names(),
            plan,
            params: Mutex::new(json!({})),
        }))
    }
}

#[derive(Clone, Debug)]
struct SourceSpec {
    collection: String,
    alias: Option<String>,
}

impl SourceSpec {
    fn parse(value: &Json) -> EngineResult<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| bad_query("FROM entries must be objects"))?;
        let collection = obj
            .get("COLLECTION")
            .and_then(Json::as_str)
            .ok_or_else(|| bad_query("FROM entry missing COLLECTION"))?
            .to_owned();
        Ok(Self {
            collection,
            alias: obj.get("AS").and_then(Json::as_str).map(str::to_owned),
        })
    }

    fn binding_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.collection)
    }
}

#[derive(Clone, Debug)]
struct JoinSpec {
    source: SourceSpec,
    kind: String,
    on: Option<Json>,
}

#[derive(Clone, Debug)]
struct Plan {
    what: Vec<Json>,
    from: SourceSpec,
    joins: Vec<JoinSpec>,
    where_: Option<Json>,
    group_by: Vec<Json>,
    having: Option<Json>,
    order_by: Vec<Json>,
    limit: Option<Json>,
    offset: Option<Json>,
    distinct: bool,
}

impl Plan {
    fn parse(ir: &Json) -> EngineResult<Self> {
        let doc = ir
            .as_object()
            .ok_or_else(|| bad_query("IR root must be an object"))?;

        let what = doc
            .get("WHAT")
            .and_then(Json::as_array)
            .filter(|entries| !entries.is_empty())
            .ok_or_else(|| bad_query("query requires a non-empty WHAT clause"))?
            .clone();

        let sources = doc
            .get("FROM")
            .and_then(Json::as_array)
            .filter(|entries| !entries.is_empty())
            .ok_or_else(|| bad_query("query requires a FROM clause"))?;
        let from = SourceSpec::parse(&sources[0])?;
        let mut joins = Vec::new();
        for entry in &sources[1..] {
            let obj = entry
                .as_object()
                .ok_or_else(|| bad_query("FROM entries must be objects"))?;
            let kind = obj
                .get("JOIN")
                .and_then(Json::as_str)
                .ok_or_else(|| bad_query("secondary FROM entry missing JOIN"))?
                .to_owned();
            let on = obj.get("ON").cloned();
            if kind != "CROSS" && on.is_none() {
                return Err(bad_query("non-CROSS join missing ON predicate"));
            }
            joins.push(JoinSpec {
                source: SourceSpec::parse(entry)?,
                kind,
                on,
            });
        }

        let plan = Self {
            what,
            from,
            joins,
            where_: doc.get("WHERE").cloned(),
            group_by: doc
                .get("GROUP_BY")
                .and_then(Json::as_array)
                .cloned()
                .unwrap_or_default(),
            having: doc.get("HAVING").cloned(),
            order_by: doc
                .get("ORDER_BY")
                .and_then(Json::as_array)
                .cloned()
                .unwrap_or_default(),
            limit: doc.get("LIMIT").cloned(),
            offset: doc.get("OFFSET").cloned(),
            distinct: doc.get("DISTINCT").and_then(Json::as_bool).unwrap_or(false),
        };
        plan.validate()?;
        Ok(plan)
    }

    fn validate(&self) -> EngineResult<()> {
        for entry in &self.what {
            validate_expr(projection_expr(entry))?;
        }
        for join in &self.joins {
            if let Some(on) = &join.on {
                validate_expr(on)?;
            }
        }
        for expr in [&self.where_, &self.having, &self.limit, &self.offset]
            .into_iter()
            .flatten()
        {
            validate_expr(expr)?;
        }
        for key in &self.group_by {
            validate_expr(key)?;
        }
        for entry in &self.order_by {
            validate_expr(order_expr(entry))?;
        }
        Ok(())
    }

    fn column_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        let mut provisional = 0usize;
        for entry in &self.what {
            let name = match entry.as_array().map(Vec::as_slice) {
                Some([head]) if head == "." => "*".to_owned(),
                Some([head, rest @ ..]) if head == "AS" => rest
                    .last()
                    .and_then(Json::as_str)
                    .map(str::to_owned)
                    .unwrap_or_else(|| provisional_name(&mut provisional)),
                Some([head, rest @ ..]) if head == "." && !rest.is_empty() => rest
                    .last()
                    .and_then(Json::as_str)
                    .map(str::to_owned)
                    .unwrap_or_else(|| provisional_name(&mut provisional)),
                _ => provisional_name(&mut provisional),
            };
            names.push(name);
        }
        names
    }
}

fn provisional_name(counter: &mut usize) -> String {
    *counter += 1;
    format!("${counter}")
}

fn projection_expr(entry: &Json) -> &Json {
    match entry.as_array().map(Vec::as_slice) {
        Some([head, expr, _alias]) if head == "AS" => expr,
        _ => entry,
    }
}

fn order_expr(entry: &Json) -> &Json {
    match entry.as_array().map(Vec::as_slice) {
        Some([head, expr]) if head == "DESC" => expr,
        _ => entry,
    }
}

struct MemoryQuery {
    shared: Arc<Shared>,
    plan: Plan,
    params: Mutex<Json>,
    columns: Vec<String>,
}

impl fmt::Debug for MemoryQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryQuery")
            .field("plan", &self.plan)
            .field("columns", &self.columns)
            .finish_non_exhaustive()
    }
}

impl CompiledQuery for MemoryQuery {
    fn run(&self, params: &Json) -> EngineResult<Option<Box<dyn RowEnumerator>>> {
        let collections = self.shared.collections.lock().clone();
        if !collections.contains_key(&self.plan.from.collection) {
            // Nothing to scan: report "no enumerator" so the client
            // substitutes its explicit empty cursor.
            return Ok(None);
        }
        let empty = params.as_object().map(|o| o.is_empty()).unwrap_or(true);
        let stored;
        let params = if empty {
            stored = self.params.lock().clone();
            &stored
        } else {
            params
        };
        let rows = Evaluator {
            plan: &self.plan,
            collections: &collections,
            params,
        }
        .run()?;
        Ok(Some(Box::new(MemoryEnumerator { rows, pos: 0 })))
    }

    fn set_parameters(&self, params: &Json) {
        *self.params.lock() = params.clone();
    }

    fn explain(&self) -> EngineResult<String> {
        let mut text = format!("SCAN {}\n", self.plan.from.collection);
        for join in &self.plan.joins {
            text.push_str(&format!("{} JOIN {}\n", join.kind, join.source.collection));
        }
        if self.plan.where_.is_some() {
            text.push_str("FILTER <predicate>\n");
        }
        if !self.plan.order_by.is_empty() {
            text.push_str("SORT\n");
        }
        Ok(text)
    }

    fn column_names(&self) -> Vec<String> {
        self.columns.clone()
    }

    fn observe(&self, hook: ChangeHook) -> EngineResult<Box<dyn ObserverGuard>> {
        let id = self.shared.next_hook.fetch_add(1, Ordering::SeqCst);
        let enabled = Arc::new(AtomicBool::new(false));
        self.shared.hooks.lock().insert(
            id,
            HookEntry {
                hook,
                enabled: enabled.clone(),
            },
        );
        Ok(Box::new(MemoryObserverGuard {
            shared: self.shared.clone(),
            id,
            enabled,
        }))
    }
}

struct MemoryObserverGuard {
    shared: Arc<Shared>,
    id: u64,
    enabled: Arc<AtomicBool>,
}

impl ObserverGuard for MemoryObserverGuard {
    fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }
}

impl Drop for MemoryObserverGuard {
    fn drop(&mut self) {
        self.shared.hooks.lock().remove(&self.id);
    }
}

struct MemoryEnumerator {
    rows: Vec<Vec<Json>>,
    pos: usize,
}

impl RowEnumerator for MemoryEnumerator {
    fn next_row(&mut self) -> EngineResult<Option<Vec<Json>>> {
        let row = self.rows.get(self.pos).cloned();
        if row.is_some() {
            self.pos += 1;
        }
        Ok(row)
    }

    fn supports_seek(&self) -> bool {
        true
    }

    fn seek(&mut self, index: usize) -> EngineResult<Option<Vec<Json>>> {
        Ok(self.rows.get(index).cloned())
    }

    fn row_count(&self) -> Option<usize> {
        Some(self.rows.len())
    }
}

/// One candidate result row: alias → document.
#[derive(Clone, Debug, Default)]
struct Env {
    docs: BTreeMap<String, Json>,
    primary: String,
    vars: Vec<(String, Json)>,
}

struct Evaluator<'a> {
    plan: &'a Plan,
    collections: &'a BTreeMap<String, Vec<Json>>,
    params: &'a Json,
}

impl Evaluator<'_> {
    fn run(&self) -> EngineResult<Vec<Vec<Json>>> {
        let mut envs = self.scan()?;

        if let Some(predicate) = &self.plan.where_ {
            let mut kept = Vec::new();
            for env in envs {
                if truthy(&self.eval(predicate, &env, None)?) {
                    kept.push(env);
                }
            }
            envs = kept;
        }

        let grouped = !self.plan.group_by.is_empty()
            || self.plan.what.iter().any(|e| has_aggregate(projection_expr(e)));
        let mut rows = if grouped {
            self.project_grouped(envs)?
        } else {
            self.project_flat(envs)?
        };

        if self.plan.distinct {
            let mut seen = std::collections::BTreeSet::new();
            rows.retain(|(row, _)| seen.insert(serde_json::to_string(row).unwrap_or_default()));
        }

        if !self.plan.order_by.is_empty() {
            rows.sort_by(|(_, a), (_, b)| {
                for (ka, kb) in a.iter().zip(b) {
                    let descending = ka.get(0).and_then(Json::as_bool).unwrap_or(false);
                    let va = ka.get(1).unwrap_or(&Json::Null);
                    let vb = kb.get(1).unwrap_or(&Json::Null);
                    let ord = if descending {
                        cmp_json(va, vb).reverse()
                    } else {
                        cmp_json(va, vb)
                    };
                    if ord != CmpOrdering::Equal {
                        return ord;
                    }
                }
                CmpOrdering::Equal
            });
        }

        let mut out: Vec<Vec<Json>> = rows.into_iter().map(|(row, _)| row).collect();

        let offset = self.bound(&self.plan.offset)?.unwrap_or(0);
        if offset > 0 {
            out = out.into_iter().skip(offset).collect();
        }
        if let Some(limit) = self.bound(&self.plan.limit)? {
            out.truncate(limit);
        }
        Ok(out)
    }

    fn scan(&self) -> EngineResult<Vec<Env>> {
        let primary_docs = self
            .collections
            .get(&self.plan.from.collection)
            .cloned()
            .unwrap_or_default();
        let primary = self.plan.from.binding_name().to_owned();
        let mut envs: Vec<Env> = primary_docs
            .into_iter()
            .map(|doc| {
                let mut docs = BTreeMap::new();
                docs.insert(primary.clone(), doc);
                Env {
                    docs,
                    primary: primary.clone(),
                    vars: Vec::new(),
                }
            })
            .collect();

        for join in &self.plan.joins {
            let joined_docs = self
                .collections
                .get(&join.source.collection)
                .cloned()
                .unwrap_or_default();
            let name = join.source.binding_name().to_owned();
            let mut next = Vec::new();
            for env in envs {
                let mut matched = false;
                for doc in &joined_docs {
                    let mut candidate = env.clone();
                    candidate.docs.insert(name.clone(), doc.clone());
                    let keep = match &join.on {
                        Some(on) => truthy(&self.eval(on, &candidate, None)?),
                        None => true,
                    };
                    if keep {
                        matched = true;
                        next.push(candidate);
                    }
                }
                if !matched && join.kind == "LEFT OUTER" {
                    next.push(env);
                }
            }
            envs = next;
        }
        Ok(envs)
    }

    fn project_flat(&self, envs: Vec<Env>) -> EngineResult<Vec<(Vec<Json>, Vec<Json>)>> {
        let mut rows = Vec::new();
        for env in envs {
            let row = self.project_one(&env, None)?;
            let keys = self.sort_keys(&env, None)?;
            rows.push((row, keys));
        }
        Ok(rows)
    }

    fn project_grouped(&self, envs: Vec<Env>) -> EngineResult<Vec<(Vec<Json>, Vec<Json>)>> {
        let mut groups: BTreeMap<String, Vec<Env>> = BTreeMap::new();
        for env in envs {
            let mut key_parts = Vec::new();
            for key in &self.plan.group_by {
                key_parts.push(self.eval(key, &env, None)?);
            }
            let key = serde_json::to_string(&key_parts).unwrap_or_default();
            groups.entry(key).or_default().push(env);
        }

        let mut rows = Vec::new();
        for group in groups.into_values() {
            let representative = group[0].clone();
            if let Some(having) = &self.plan.having {
                if !truthy(&self.eval(having, &representative, Some(&group))?) {
                    continue;
                }
            }
            let row = self.project_one(&representative, Some(&group))?;
            let keys = self.sort_keys(&representative, Some(&group))?;
            rows.push((row, keys));
        }
        Ok(rows)
    }

    fn project_one(&self, env: &Env, group: Option<&[Env]>) -> EngineResult<Vec<Json>> {
        let mut row = Vec::new();
        for entry in &self.plan.what {
            let wildcard = entry
                .as_array()
                .map(|parts| parts.len() == 1 && parts[0] == ".")
                .unwrap_or(false);
            if wildcard {
                row.push(env.docs.get(&env.primary).cloned().unwrap_or(Json::Null));
            } else {
                row.push(self.eval(projection_expr(entry), env, group)?);
            }
        }
        Ok(row)
    }

    fn sort_keys(&self, env: &Env, group: Option<&[Env]>) -> EngineResult<Vec<Json>> {
        let mut keys = Vec::new();
        for entry in &self.plan.order_by {
            let descending = entry.as_array().map(Vec::as_slice).map_or(false, |parts| {
                parts.first().map(|p| p == "DESC").unwrap_or(false)
            });
            let value = self.eval(order_expr(entry), env, group)?;
            keys.push(json!([descending, value]));
        }
        Ok(keys)
    }

    fn bound(&self, expr: &Option<Json>) -> EngineResult<Option<usize>> {
        match expr {
            None => Ok(None),
            Some(expr) => {
                let value = self.eval(expr, &Env::default(), None)?;
                value
                    .as_f64()
                    .map(|n| n.max(0.0) as usize)
                    .map(Some)
                    .ok_or_else(|| bad_query("LIMIT/OFFSET must evaluate to a number"))
            }
        }
    }

    fn eval(&self, expr: &Json, env: &Env, group: Option<&[Env]>) -> EngineResult<Json> {
        let parts = match expr {
            Json::Array(parts) => parts,
            other => return Ok(other.clone()),
        };
        let token = match parts.first().and_then(Json::as_str) {
            Some(token) => token,
            None => return Ok(expr.clone()),
        };
        match token {
            "." => Ok(self.lookup(&parts[1..], env).unwrap_or(Json::Null)),
            "$" => Ok(parts
                .get(1)
                .and_then(Json::as_str)
                .and_then(|name| self.params.get(name))
                .cloned()
                .unwrap_or(Json::Null)),
            "?" => {
                let name = parts.get(1).and_then(Json::as_str).unwrap_or_default();
                Ok(env
                    .vars
                    .iter()
                    .rev()
                    .find(|(var, _)| var == name)
                    .map(|(_, value)| value.clone())
                    .unwrap_or(Json::Null))
            }
            "[]" => {
                let mut items = Vec::new();
                for item in &parts[1..] {
                    items.push(self.eval(item, env, group)?);
                }
                Ok(Json::Array(items))
            }
            "MISSING" => Ok(Json::Null),
            "=" | "!=" | "<" | "<=" | ">" | ">=" => {
                let lhs = self.eval(&parts[1], env, group)?;
                let rhs = self.eval(&parts[2], env, group)?;
                let ord = cmp_json(&lhs, &rhs);
                let result = match token {
                    "=" => ord == CmpOrdering::Equal,
                    "!=" => ord != CmpOrdering::Equal,
                    "<" => ord == CmpOrdering::Less,
                    "<=" => ord != CmpOrdering::Greater,
                    ">" => ord == CmpOrdering::Greater,
                    ">=" => ord != CmpOrdering::Less,
                    _ => unreachable!(),
                };
                Ok(json!(result))
            }
            "+" | "-" | "*" | "/" | "%" => {
                let lhs = self.number(&parts[1], env, group)?;
                let rhs = self.number(&parts[2], env, group)?;
                let result = match token {
                    "+" => lhs + rhs,
                    "-" => lhs - rhs,
                    "*" => lhs * rhs,
                    "/" => lhs / rhs,
                    "%" => lhs % rhs,
                    _ => unreachable!(),
                };
                Ok(number_json(result))
            }
            "AND" => {
                for operand in &parts[1..] {
                    if !truthy(&self.eval(operand, env, group)?) {
                        return Ok(json!(false));
                    }
                }
                Ok(json!(true))
            }
            "OR" => {
                for operand in &parts[1..] {
                    if truthy(&self.eval(operand, env, group)?) {
                        return Ok(json!(true));
                    }
                }
                Ok(json!(false))
            }
            "NOT" => Ok(json!(!truthy(&self.eval(&parts[1], env, group)?))),
            "LIKE" => {
                let lhs = self.eval(&parts[1], env, group)?;
                let rhs = self.eval(&parts[2], env, group)?;
                match (lhs.as_str(), rhs.as_str()) {
                    (Some(s), Some(p)) => Ok(json!(like_match(s, p))),
                    _ => Ok(json!(false)),
                }
            }
            "BETWEEN" => {
                let x = self.eval(&parts[1], env, group)?;
                let lo = self.eval(&parts[2], env, group)?;
                let hi = self.eval(&parts[3], env, group)?;
                Ok(json!(
                    cmp_json(&x, &lo) != CmpOrdering::Less
                        && cmp_json(&x, &hi) != CmpOrdering::Greater
                ))
            }
            "IN" => {
                let needle = self.eval(&parts[1], env, group)?;
                let haystack = self.eval(&parts[2], env, group)?;
                let found = haystack
                    .as_array()
                    .map(|items| {
                        items
                            .iter()
                            .any(|item| cmp_json(item, &needle) == CmpOrdering::Equal)
                    })
                    .unwrap_or(false);
                Ok(json!(found))
            }
            "IS" | "IS NOT" => {
                let lhs = self.eval(&parts[1], env, group)?;
                let rhs_raw = &parts[2];
                let missing_token = rhs_raw
                    .as_array()
                    .map(|p| p.len() == 1 && p[0] == "MISSING")
                    .unwrap_or(false);
                let is_match = if rhs_raw.is_null() || missing_token {
                    lhs.is_null()
                } else {
                    let rhs = self.eval(rhs_raw, env, group)?;
                    cmp_json(&lhs, &rhs) == CmpOrdering::Equal
                };
                Ok(json!(if token == "IS" { is_match } else { !is_match }))
            }
            "IS VALUED" => Ok(json!(!self.eval(&parts[1], env, group)?.is_null())),
            "ANY" | "EVERY" | "ANY AND EVERY" => {
                let variable = parts
                    .get(1)
                    .and_then(Json::as_str)
                    .ok_or_else(|| bad_query("quantifier missing variable name"))?;
                let source = self.eval(&parts[2], env, group)?;
                let items = source.as_array().cloned().unwrap_or_default();
                let mut matches = 0usize;
                for item in &items {
                    let mut scoped = env.clone();
                    scoped.vars.push((variable.to_owned(), item.clone()));
                    if truthy(&self.eval(&parts[3], &scoped, group)?) {
                        matches += 1;
                    }
                }
                let result = match token {
                    "ANY" => matches > 0,
                    "EVERY" => matches == items.len(),
                    _ => !items.is_empty() && matches == items.len(),
                };
                Ok(json!(result))
            }
            "COUNT()" | "SUM()" | "AVG()" | "MIN()" | "MAX()" => {
                let over: Vec<Env> = match group {
                    Some(group) => group.to_vec(),
                    None => vec![env.clone()],
                };
                if token == "COUNT()" {
                    return Ok(json!(over.len()));
                }
                let mut values = Vec::new();
                for member in &over {
                    let value = self.eval(&parts[1], member, None)?;
                    if let Some(n) = value.as_f64() {
                        values.push(n);
                    }
                }
                let result = match token {
                    "SUM()" => Some(values.iter().sum::<f64>()),
                    "AVG()" => {
                        if values.is_empty() {
                            None
                        } else {
                            Some(values.iter().sum::<f64>() / values.len() as f64)
                        }
                    }
                    "MIN()" => values.iter().copied().reduce(f64::min),
                    "MAX()" => values.iter().copied().reduce(f64::max),
                    _ => unreachable!(),
                };
                Ok(result.map(number_json).unwrap_or(Json::Null))
            }
            "LOWER()" | "UPPER()" => {
                let value = self.eval(&parts[1], env, group)?;
                Ok(value
                    .as_str()
                    .map(|s| {
                        json!(if token == "LOWER()" {
                            s.to_lowercase()
                        } else {
                            s.to_uppercase()
                        })
                    })
                    .unwrap_or(Json::Null))
            }
            "LENGTH()" => {
                let value = self.eval(&parts[1], env, group)?;
                Ok(value
                    .as_str()
                    .map(|s| json!(s.chars().count()))
                    .unwrap_or(Json::Null))
            }
            "ABS()" => {
                let value = self.number(&parts[1], env, group)?;
                Ok(number_json(value.abs()))
            }
            "CONTAINS()" => {
                let value = self.eval(&parts[1], env, group)?;
                let needle = self.eval(&parts[2], env, group)?;
                match (value.as_str(), needle.as_str()) {
                    (Some(s), Some(n)) => Ok(json!(s.contains(n))),
                    _ => Ok(json!(false)),
                }
            }
            "COLLATE" => self.eval(&parts[2], env, group),
            other => Err(bad_query(format!("unknown operator '{other}'"))),
        }
    }

    fn number(&self, expr: &Json, env: &Env, group: Option<&[Env]>) -> EngineResult<f64> {
        self.eval(expr, env, group)?
            .as_f64()
            .ok_or_else(|| bad_query("operand is not a number"))
    }

    fn lookup(&self, segments: &[Json], env: &Env) -> Option<Json> {
        let mut names: Vec<&str> = segments.iter().filter_map(Json::as_str).collect();
        if names.is_empty() {
            return env.docs.get(&env.primary).cloned();
        }
        let doc = if env.docs.contains_key(names[0]) && names.len() > 1 {
            let doc = env.docs.get(names[0]);
            names.remove(0);
            doc
        } else {
            env.docs.get(&env.primary)
        }?;
        let mut current = doc;
        for name in names {
            current = current.get(name)?;
        }
        Some(current.clone())
    }
}

fn bad_query(message: impl Into<String>) -> EngineError {
    EngineError::new(ErrorDomain::Query, ERR_BAD_QUERY, message)
}

fn has_aggregate(expr: &Json) -> bool {
    match expr {
        Json::Array(parts) => {
            let own = parts
                .first()
                .and_then(Json::as_str)
                .map(|t| matches!(t, "COUNT()" | "SUM()" | "AVG()" | "MIN()" | "MAX()"))
                .unwrap_or(false);
            own || parts.iter().any(has_aggregate)
        }
        _ => false,
    }
}

const KNOWN_TOKENS: &[&str] = &[
    ".", "$", "?", "[]", "MISSING", "=", "!=", "<", "<=", ">", ">=", "+", "-", "*", "/", "%",
    "AND", "OR", "NOT", "LIKE", "BETWEEN", "IN", "IS", "IS NOT", "IS VALUED", "ANY", "EVERY",
    "ANY AND EVERY", "COUNT()", "SUM()", "AVG()", "MIN()", "MAX()", "LOWER()", "UPPER()",
    "LENGTH()", "ABS()", "CONTAINS()", "COLLATE", "DESC",
];

fn validate_expr(expr: &Json) -> EngineResult<()> {
    let parts = match expr {
        Json::Array(parts) => parts,
        _ => return Ok(()),
    };
    if let Some(token) = parts.first().and_then(Json::as_str) {
        if token == "MATCH" {
            return Err(EngineError::new(
                ErrorDomain::FullText,
                ERR_UNSUPPORTED,
                "full-text MATCH is not supported by the in-memory engine",
            ));
        }
        if token == "REGEXP_LIKE()" {
            return Err(EngineError::new(
                ErrorDomain::Query,
                ERR_UNSUPPORTED,
                "REGEXP_LIKE() is not supported by the in-memory engine",
            ));
        }
        if token == "." || token == "$" || token == "?" {
            return Ok(());
        }
        if !KNOWN_TOKENS.contains(&token) {
            return Err(bad_query(format!("unknown operator '{token}'")));
        }
        let arity_ok = match token {
            "=" | "!=" | "<" | "<=" | ">" | ">=" | "+" | "-" | "*" | "/" | "%" | "LIKE" | "IN"
            | "IS" | "IS NOT" | "CONTAINS()" | "COLLATE" => parts.len() == 3,
            "NOT" | "IS VALUED" | "DESC" | "COUNT()" | "SUM()" | "AVG()" | "MIN()" | "MAX()"
            | "LOWER()" | "UPPER()" | "LENGTH()" | "ABS()" => parts.len() == 2,
            "BETWEEN" | "ANY" | "EVERY" | "ANY AND EVERY" => parts.len() == 4,
            "AND" | "OR" => parts.len() >= 3,
            _ => true,
        };
        if !arity_ok {
            return Err(bad_query(format!("wrong operand count for '{token}'")));
        }
        let skip = if token == "ANY" || token == "EVERY" || token == "ANY AND EVERY" {
            // Variable name sits in operand position.
            2
        } else {
            1
        };
        for operand in parts.iter().skip(skip) {
            validate_expr(operand)?;
        }
    }
    Ok(())
}

fn truthy(value: &Json) -> bool {
    match value {
        Json::Null => false,
        Json::Bool(b) => *b,
        _ => true,
    }
}

fn type_rank(value: &Json) -> u8 {
    match value {
        Json::Null => 0,
        Json::Bool(_) => 1,
        Json::Number(_) => 2,
        Json::String(_) => 3,
        Json::Array(_) => 4,
        Json::Object(_) => 5,
    }
}

pub(crate) fn cmp_json(a: &Json, b: &Json) -> CmpOrdering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != CmpOrdering::Equal {
        return rank;
    }
    match (a, b) {
        (Json::Null, Json::Null) => CmpOrdering::Equal,
        (Json::Bool(x), Json::Bool(y)) => x.cmp(y),
        (Json::Number(x), Json::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(CmpOrdering::Equal),
        (Json::String(x), Json::String(y)) => x.cmp(y),
        (Json::Array(x), Json::Array(y)) => {
            for (xa, ya) in x.iter().zip(y) {
                let ord = cmp_json(xa, ya);
                if ord != CmpOrdering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Json::Object(x), Json::Object(y)) => {
            let xs = serde_json::to_string(x).unwrap_or_default();
            let ys = serde_json::to_string(y).unwrap_or_default();
            xs.cmp(&ys)
        }
        _ => CmpOrdering::Equal,
    }
}

fn number_json(value: f64) -> Json {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        json!(value as i64)
    } else {
        json!(value)
    }
}

fn like_match(s: &str, pattern: &str) -> bool {
    fn inner(s: &[char], p: &[char]) -> bool {
        match p.split_first() {
            None => s.is_empty(),
            Some(('%', rest)) => {
                (0..=s.len()).any(|skip| inner(&s[skip..], rest))
            }
            Some(('_', rest)) => match s.split_first() {
                Some((_, s_rest)) => inner(s_rest, rest),
                None => false,
            },
            Some((c, rest)) => match s.split_first() {
                Some((sc, s_rest)) => sc == c && inner(s_rest, rest),
                None => false,
            },
        }
    }
    let s: Vec<char> = s.chars().collect();
    let p: Vec<char> = pattern.chars().collect();
    inner(&s, &p)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> MemoryEngine {
        let engine = MemoryEngine::new();
        engine.insert("users", json!({"name": "Bob", "age": 40}));
        engine.insert("users", json!({"name": "Al", "age": 20}));
        engine
    }

    fn run(engine: &MemoryEngine, ir: Json) -> Vec<Vec<Json>> {
        let compiled = engine.compile(&ir).expect("compile");
        let mut rows = Vec::new();
        let mut cursor = compiled.run(&json!({})).expect("run").expect("enumerator");
        while let Some(row) = cursor.next_row().expect("row") {
            rows.push(row);
        }
        rows
    }

    #[test]
    fn filters_and_projects() {
        let rows = run(
            &seeded(),
            json!({
                "WHAT": [[".", "name"]],
                "FROM": [{"COLLECTION": "users"}],
                "WHERE": [">", [".", "age"], 30],
            }),
        );
        assert_eq!(rows, vec![vec![json!("Bob")]]);
    }

    #[test]
    fn like_and_in_operators() {
        let engine = seeded();
        let rows = run(
            &engine,
            json!({
                "WHAT": [[".", "name"]],
                "FROM": [{"COLLECTION": "users"}],
                "WHERE": ["LIKE", [".", "name"], "B%"],
            }),
        );
        assert_eq!(rows, vec![vec![json!("Bob")]]);

        let rows = run(
            &engine,
            json!({
                "WHAT": [[".", "age"]],
                "FROM": [{"COLLECTION": "users"}],
                "WHERE": ["IN", [".", "name"], ["[]", "Al", "Zed"]],
            }),
        );
        assert_eq!(rows, vec![vec![json!(20)]]);
    }

    #[test]
    fn group_by_with_count() {
        let engine = seeded();
        engine.insert("users", json!({"name": "Cy", "age": 40}));
        let rows = run(
            &engine,
            json!({
                "WHAT": [[".", "age"], ["COUNT()", [".", "name"]]],
                "FROM": [{"COLLECTION": "users"}],
                "GROUP_BY": [[".", "age"]],
            }),
        );
        assert_eq!(rows, vec![vec![json!(20), json!(1)], vec![json!(40), json!(2)]]);
    }

    #[test]
    fn unknown_collection_yields_no_enumerator() {
        let engine = MemoryEngine::new();
        let compiled = engine
            .compile(&json!({
                "WHAT": [["."]],
                "FROM": [{"COLLECTION": "ghosts"}],
            }))
            .expect("compile");
        assert!(compiled.run(&json!({})).expect("run").is_none());
    }

    #[test]
    fn match_is_rejected_at_compile() {
        let engine = MemoryEngine::new();
        let err = engine
            .compile(&json!({
                "WHAT": [["."]],
                "FROM": [{"COLLECTION": "users"}],
                "WHERE": ["MATCH", "fts", "text"],
            }))
            .unwrap_err();
        assert_eq!(err.domain, ErrorDomain::FullText);
    }

    #[test]
    fn observers_fire_only_while_enabled() {
        let engine = MemoryEngine::new();
        engine.insert("users", json!({"name": "Bob"}));
        let compiled = engine
            .compile(&json!({
                "WHAT": [["."]],
                "FROM": [{"COLLECTION": "users"}],
            }))
            .expect("compile");

        let fired = Arc::new(AtomicU64::new(0));
        let hook_fired = fired.clone();
        let guard = compiled
            .observe(Arc::new(move || {
                hook_fired.fetch_add(1, Ordering::SeqCst);
            }))
            .expect("observe");

        engine.insert("users", json!({"name": "Al"}));
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        guard.enable();
        engine.insert("users", json!({"name": "Cy"}));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        guard.disable();
        engine.insert("users", json!({"name": "Di"}));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        drop(guard);
        engine.insert("users", json!({"name": "Ed"}));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn like_matcher() {
        assert!(like_match("Bob", "B%"));
        assert!(like_match("Bob", "_o_"));
        assert!(!like_match("Bob", "b%"));
        assert!(like_match("", "%"));
    }
}

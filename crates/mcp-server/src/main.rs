use anyhow::{Context, Result};
use chrono::NaiveDate;
use pitwall::{EntityId, FactFilter, Interval, RelationType};
use pitwall_pipeline::{AskOutcome, EntityLookup, Pitwall, RawTuple};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::env;
use std::io::{self, BufRead, BufReader, Write};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const MAX_MESSAGE_BYTES: usize = 1_048_576; // 1 MiB
const MAX_QUESTION_BYTES: usize = 2 * 1024;
const MAX_NAME_BYTES: usize = 512;
const MAX_INGEST_TUPLES: usize = 1_000;
const MAX_FACTS_RETURNED: usize = 500;
const MAX_CONFLICT_LIMIT: usize = 200;

struct AppState {
    pitwall: Pitwall,
}

impl AppState {
    fn open() -> Result<Self> {
        let db_path =
            env::var("PITWALL_DB_PATH").unwrap_or_else(|_| "./pitwall.redb".to_string());
        info!(path = %db_path, "opening fact store");
        let pitwall = Pitwall::open(&db_path)?;
        Ok(Self { pitwall })
    }
}

/// Logs go to stderr; stdout carries the protocol.
fn init_tracing() {
    let filter =
        EnvFilter::try_from_env("PITWALL_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(true)
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();
    let mut state = AppState::open().context("failed to open pitwall database")?;
    let stdin = io::stdin();
    let mut reader = BufReader::new(stdin.lock());
    let stdout = io::stdout();
    let mut writer = stdout.lock();

    loop {
        let maybe = match read_message(&mut reader) {
            Ok(m) => m,
            Err(e) => {
                // Bad framing gets a JSON-RPC parse error; keep reading.
                warn!(error = %e, "unreadable message");
                let err_resp = json!({
                    "jsonrpc": "2.0",
                    "id": null,
                    "error": { "code": -32700, "message": format!("Parse error: {e}") }
                });
                write_message(&mut writer, &err_resp)?;
                continue;
            }
        };
        let Some(request) = maybe else {
            break;
        };
        if let Some(response) = handle_request(&mut state, &request) {
            write_message(&mut writer, &response)?;
        }
    }

    info!("stdin closed, shutting down");
    Ok(())
}

fn read_message<R: BufRead>(reader: &mut R) -> Result<Option<JsonValue>> {
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }

        if let Some((name, value)) = trimmed.split_once(':') {
            if name.eq_ignore_ascii_case("Content-Length") {
                content_length = Some(
                    value
                        .trim()
                        .parse::<usize>()
                        .context("invalid Content-Length")?,
                );
            }
        }
    }

    let len = content_length.context("missing Content-Length header")?;
    if len > MAX_MESSAGE_BYTES {
        anyhow::bail!(
            "Content-Length {} exceeds max allowed {} bytes",
            len,
            MAX_MESSAGE_BYTES
        );
    }
    let mut payload = vec![0_u8; len];
    reader.read_exact(&mut payload)?;
    let value: JsonValue = serde_json::from_slice(&payload).context("invalid JSON payload")?;
    Ok(Some(value))
}

fn write_message<W: Write>(writer: &mut W, value: &JsonValue) -> Result<()> {
    let payload = serde_json::to_vec(value)?;
    write!(writer, "Content-Length: {}\r\n\r\n", payload.len())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

fn handle_request(state: &mut AppState, req: &JsonValue) -> Option<JsonValue> {
    let id = req.get("id").cloned();
    let method = req.get("method").and_then(JsonValue::as_str)?;
    debug!(method, "request");

    match method {
        "initialize" => id.map(|id_val| {
            json!({
                "jsonrpc": "2.0",
                "id": id_val,
                "result": {
                    "protocolVersion": "2024-11-05",
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": "pitwall-mcp", "version": env!("CARGO_PKG_VERSION") }
                }
            })
        }),
        "notifications/initialized" => None,
        "tools/list" => id.map(|id_val| {
            json!({
                "jsonrpc": "2.0",
                "id": id_val,
                "result": {
                    "tools": tools_schema()
                }
            })
        }),
        "tools/call" => id.map(|id_val| {
            let result = call_tool(state, req.get("params"));
            match result {
                Ok(tool_result) => json!({
                    "jsonrpc": "2.0",
                    "id": id_val,
                    "result": tool_result
                }),
                Err(err) => {
                    warn!(error = %err, "tool call failed");
                    json!({
                        "jsonrpc": "2.0",
                        "id": id_val,
                        "result": {
                            "content": [{ "type": "text", "text": format!("tool error: {err:#}") }],
                            "isError": true
                        }
                    })
                }
            }
        }),
        "ping" => id.map(|id_val| json!({ "jsonrpc": "2.0", "id": id_val, "result": {} })),
        _ => id.map(|id_val| {
            json!({
                "jsonrpc": "2.0",
                "id": id_val,
                "error": {
                    "code": -32601,
                    "message": format!("method not found: {method}")
                }
            })
        }),
    }
}

fn tools_schema() -> Vec<JsonValue> {
    vec![
        json!({
            "name": "ingest",
            "description": "Normalize and store raw relationship tuples. Conflicting facts are resolved on insert.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "tuples": {
                        "type": "array",
                        "maxItems": MAX_INGEST_TUPLES,
                        "items": {
                            "type": "object",
                            "properties": {
                                "subject": {"type": "string"},
                                "predicate": {"type": "string"},
                                "object": {"type": "string"},
                                "time": {"type": ["string", "integer"]},
                                "sentence": {"type": "string"},
                                "document": {"type": "string"},
                                "confidence": {"type": "number", "minimum": 0.0, "maximum": 1.0}
                            },
                            "required": ["subject", "predicate", "object"]
                        }
                    }
                },
                "required": ["tuples"]
            }
        }),
        json!({
            "name": "ask",
            "description": "Answer a time-scoped question such as \"Who was Lewis Hamilton's race engineer in 2017?\".",
            "inputSchema": {
                "type": "object",
                "properties": { "question": {"type": "string"} },
                "required": ["question"]
            }
        }),
        json!({
            "name": "query_facts",
            "description": "Facts matching a partial (subject, predicate, object) key that are in force at a date or within a date range.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "subject": {"type": "string"},
                    "predicate": {"type": "string"},
                    "object": {"type": "string"},
                    "at": {"type": "string", "format": "date"},
                    "from": {"type": "string", "format": "date"},
                    "to": {"type": "string", "format": "date"},
                    "include_superseded": {"type": "boolean"}
                }
            }
        }),
        json!({
            "name": "entity",
            "description": "Look up an entity by any known name and list the facts it is the subject of.",
            "inputSchema": {
                "type": "object",
                "properties": { "name": {"type": "string"} },
                "required": ["name"]
            }
        }),
        json!({
            "name": "conflicts",
            "description": "Most recent conflict-resolution decisions, oldest first.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "limit": {"type": "integer", "minimum": 1, "maximum": MAX_CONFLICT_LIMIT}
                }
            }
        }),
        json!({
            "name": "stats",
            "description": "Entity, fact, supersession and conflict counts.",
            "inputSchema": { "type": "object", "properties": {} }
        }),
    ]
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct QueryFactsArgs {
    subject: Option<String>,
    predicate: Option<String>,
    object: Option<String>,
    at: Option<String>,
    from: Option<String>,
    to: Option<String>,
    include_superseded: bool,
}

fn call_tool(state: &mut AppState, params: Option<&JsonValue>) -> Result<JsonValue> {
    let name = params
        .and_then(|v| v.get("name"))
        .and_then(JsonValue::as_str)
        .context("missing tool name")?;
    let args = params
        .and_then(|v| v.get("arguments"))
        .cloned()
        .unwrap_or_else(|| json!({}));

    match name {
        "ingest" => {
            let raw = args.get("tuples").context("tuples is required")?;
            let count = raw.as_array().context("tuples must be an array")?.len();
            if count > MAX_INGEST_TUPLES {
                anyhow::bail!("tuples exceeds max allowed batch size ({MAX_INGEST_TUPLES})");
            }
            let tuples: Vec<RawTuple> =
                serde_json::from_value(raw.clone()).context("invalid tuple")?;
            let stats = state.pitwall.ingest_tuples(&tuples)?;
            Ok(json!({
                "content": [{
                    "type": "text",
                    "text": format!(
                        "inserted {}, duplicates {}, rejected {}, conflicts {}",
                        stats.inserted,
                        stats.duplicates,
                        stats.rejected_total(),
                        stats.conflicts
                    )
                }],
                "structuredContent": stats
            }))
        }
        "ask" => {
            let question = args
                .get("question")
                .and_then(JsonValue::as_str)
                .context("question is required")?;
            if question.len() > MAX_QUESTION_BYTES {
                anyhow::bail!(
                    "question exceeds max allowed size ({} bytes)",
                    MAX_QUESTION_BYTES
                );
            }
            let outcome = state.pitwall.ask(question)?;
            let text = match &outcome {
                AskOutcome::Answered { summary, .. } => summary.clone(),
                AskOutcome::NoFactFound { window, .. } => format!("no fact found for {window}"),
                AskOutcome::CannotAnswer { reason } => reason.to_string(),
            };
            Ok(json!({
                "content": [{ "type": "text", "text": text }],
                "structuredContent": outcome
            }))
        }
        "query_facts" => {
            let args: QueryFactsArgs =
                serde_json::from_value(args).context("invalid query_facts arguments")?;
            let filter = fact_filter(state, &args)?;
            let window = query_window(&args)?;
            let mut matches = if args.include_superseded {
                let mut all = state.pitwall.store().history(&filter)?;
                all.retain(|m| m.fact.interval.overlaps(&window));
                all
            } else {
                state.pitwall.store().query(&filter, window)?
            };
            let total = matches.len();
            matches.truncate(MAX_FACTS_RETURNED);
            Ok(json!({
                "content": [{
                    "type": "text",
                    "text": format!("{total} fact(s) within {window}")
                }],
                "structuredContent": {
                    "window": window,
                    "total": total,
                    "facts": matches
                }
            }))
        }
        "entity" => {
            let name = args
                .get("name")
                .and_then(JsonValue::as_str)
                .context("name is required")?;
            if name.len() > MAX_NAME_BYTES {
                anyhow::bail!("name exceeds max allowed size ({} bytes)", MAX_NAME_BYTES);
            }
            let store = state.pitwall.store();
            let entity = match store.lookup_entity(name)? {
                Some(id) => store.entity(&id)?,
                None => None,
            };
            let Some(entity) = entity else {
                return Ok(json!({
                    "content": [{ "type": "text", "text": format!("unknown entity: {name}") }],
                    "structuredContent": { "entity": null, "facts": [] }
                }));
            };
            let facts = store.history(&FactFilter::new().subject(entity.id.clone()))?;
            Ok(json!({
                "content": [{
                    "type": "text",
                    "text": format!("{} ({}), {} fact(s)", entity.name, entity.id, facts.len())
                }],
                "structuredContent": { "entity": entity, "facts": facts }
            }))
        }
        "conflicts" => {
            let limit = args.get("limit").and_then(JsonValue::as_u64).unwrap_or(20) as usize;
            if limit > MAX_CONFLICT_LIMIT {
                anyhow::bail!("limit exceeds max allowed value ({MAX_CONFLICT_LIMIT})");
            }
            let events = state.pitwall.store().conflict_log(limit)?;
            Ok(json!({
                "content": [{ "type": "text", "text": format!("{} conflict event(s)", events.len()) }],
                "structuredContent": { "events": events }
            }))
        }
        "stats" => {
            let stats = state.pitwall.store().stats()?;
            Ok(json!({
                "content": [{
                    "type": "text",
                    "text": format!(
                        "{} entities, {} facts ({} fully superseded), {} conflict events",
                        stats.entities, stats.facts, stats.fully_superseded, stats.conflict_events
                    )
                }],
                "structuredContent": stats
            }))
        }
        _ => anyhow::bail!("unknown tool: {name}"),
    }
}

/// Entity names resolve through the alias table; an unknown name still
/// filters, it just matches nothing.
fn fact_filter(state: &AppState, args: &QueryFactsArgs) -> Result<FactFilter> {
    let store = state.pitwall.store();
    let resolve = |name: &str| -> Result<EntityId> {
        if name.len() > MAX_NAME_BYTES {
            anyhow::bail!("entity name exceeds max allowed size ({} bytes)", MAX_NAME_BYTES);
        }
        Ok(store
            .lookup_entity(name)?
            .unwrap_or_else(|| EntityId::from_name(name)))
    };

    let mut filter = FactFilter::new();
    if let Some(subject) = &args.subject {
        filter = filter.subject(resolve(subject)?);
    }
    if let Some(predicate) = &args.predicate {
        let relation = RelationType::from_synonym(predicate)
            .with_context(|| format!("unknown predicate: {predicate}"))?;
        filter = filter.predicate(relation);
    }
    if let Some(object) = &args.object {
        filter = filter.object(resolve(object)?);
    }
    Ok(filter)
}

fn query_window(args: &QueryFactsArgs) -> Result<Interval> {
    let day = |field: &str, v: &Option<String>| -> Result<Option<NaiveDate>> {
        v.as_deref()
            .map(|s| {
                s.parse::<NaiveDate>()
                    .with_context(|| format!("{field} must be YYYY-MM-DD"))
            })
            .transpose()
    };

    match (day("at", &args.at)?, day("from", &args.from)?, day("to", &args.to)?) {
        (Some(_), Some(_), _) | (Some(_), _, Some(_)) => {
            anyhow::bail!("use either at or from/to, not both")
        }
        (Some(at), None, None) => Ok(Interval::point(at)),
        (None, from, to) => Ok(Interval::from_bounds(from, to)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::NamedTempFile;

    fn temp_state() -> (AppState, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_string_lossy().to_string();
        let state = AppState {
            pitwall: Pitwall::open(&path).unwrap(),
        };
        (state, file)
    }

    fn call(state: &mut AppState, name: &str, arguments: JsonValue) -> Result<JsonValue> {
        call_tool(state, Some(&json!({ "name": name, "arguments": arguments })))
    }

    fn ingest_employers(state: &mut AppState) {
        call(
            state,
            "ingest",
            json!({
                "tuples": [
                    { "subject": "Williams", "predicate": "employs", "object": "Valtteri Bottas",
                      "time": "2015-2018", "document": "Williams", "confidence": 0.9 },
                    { "subject": "Williams", "predicate": "employs", "object": "Felipe Massa",
                      "time": "2017-2020", "document": "Williams", "confidence": 0.8 }
                ]
            }),
        )
        .unwrap();
    }

    fn text_of(out: &JsonValue) -> &str {
        out["content"][0]["text"].as_str().unwrap()
    }

    #[test]
    fn ingest_then_ask_returns_summary() {
        let (mut state, _tmp) = temp_state();
        let out = call(
            &mut state,
            "ingest",
            json!({
                "tuples": [{
                    "subject": "Lewis Hamilton",
                    "predicate": "had_race_engineer",
                    "object": "Peter Bonnington",
                    "year": "2013-2024",
                    "source_page": "Lewis Hamilton"
                }]
            }),
        )
        .unwrap();
        assert_eq!(out["structuredContent"]["inserted"], 1);

        let out = call(
            &mut state,
            "ask",
            json!({ "question": "Who was Lewis Hamilton's race engineer in 2017?" }),
        )
        .unwrap();
        assert_eq!(out["structuredContent"]["status"], "answered");
        assert_eq!(text_of(&out), "Peter Bonnington (2017)");
    }

    #[test]
    fn ask_reports_negative_and_unanswerable() {
        let (mut state, _tmp) = temp_state();
        ingest_employers(&mut state);

        let out = call(&mut state, "ask", json!({ "question": "Who did Williams employ in 2010?" }))
            .unwrap();
        assert_eq!(out["structuredContent"]["status"], "no_fact_found");

        let out = call(&mut state, "ask", json!({ "question": "Is it raining?" })).unwrap();
        assert_eq!(out["structuredContent"]["status"], "cannot_answer");
        assert!(text_of(&out).contains("please rephrase"));
    }

    #[test]
    fn query_facts_honours_conflict_resolution() {
        let (mut state, _tmp) = temp_state();
        ingest_employers(&mut state);

        let out = call(
            &mut state,
            "query_facts",
            json!({ "subject": "Williams", "predicate": "employs", "at": "2018-06-01" }),
        )
        .unwrap();
        let facts = out["structuredContent"]["facts"].as_array().unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0]["fact"]["object"], "valtteri-bottas");

        let out = call(
            &mut state,
            "query_facts",
            json!({ "subject": "Williams", "from": "2019-01-01", "to": "2020-12-31" }),
        )
        .unwrap();
        let facts = out["structuredContent"]["facts"].as_array().unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0]["fact"]["object"], "felipe-massa");
    }

    #[test]
    fn query_facts_rejects_bad_arguments() {
        let (mut state, _tmp) = temp_state();
        let err = call(&mut state, "query_facts", json!({ "predicate": "likes" }))
            .expect_err("unknown predicate must fail");
        assert!(err.to_string().contains("unknown predicate"));

        let err = call(
            &mut state,
            "query_facts",
            json!({ "at": "2017-01-01", "from": "2016-01-01" }),
        )
        .expect_err("at with from must fail");
        assert!(err.to_string().contains("either at or from/to"));

        let err = call(&mut state, "query_facts", json!({ "at": "2017" }))
            .expect_err("bad date must fail");
        assert!(err.to_string().contains("YYYY-MM-DD"));
    }

    #[test]
    fn conflicts_and_stats_report_the_trim() {
        let (mut state, _tmp) = temp_state();
        ingest_employers(&mut state);

        let out = call(&mut state, "conflicts", json!({})).unwrap();
        let events = out["structuredContent"]["events"].as_array().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["reason"], "higher_confidence");

        let out = call(&mut state, "stats", json!({})).unwrap();
        assert_eq!(out["structuredContent"]["facts"], 2);
        assert_eq!(out["structuredContent"]["partially_superseded"], 1);
        assert_eq!(out["structuredContent"]["conflict_events"], 1);
    }

    #[test]
    fn entity_lookup_by_alias() {
        let (mut state, _tmp) = temp_state();
        ingest_employers(&mut state);

        let out = call(&mut state, "entity", json!({ "name": "williams" })).unwrap();
        assert_eq!(out["structuredContent"]["entity"]["id"], "williams");
        assert_eq!(out["structuredContent"]["facts"].as_array().unwrap().len(), 2);

        let out = call(&mut state, "entity", json!({ "name": "Brawn GP" })).unwrap();
        assert!(out["structuredContent"]["entity"].is_null());
    }

    #[test]
    fn read_message_rejects_oversized_frame() {
        let raw = format!("Content-Length: {}\r\n\r\n", MAX_MESSAGE_BYTES + 1);
        let mut cursor = Cursor::new(raw.into_bytes());
        let err = read_message(&mut cursor).expect_err("oversized frame must fail");
        assert!(err.to_string().contains("exceeds max allowed"));
    }

    #[test]
    fn limits_are_enforced() {
        let (mut state, _tmp) = temp_state();
        let err = call(
            &mut state,
            "conflicts",
            json!({ "limit": MAX_CONFLICT_LIMIT + 1 }),
        )
        .expect_err("excessive limit must fail");
        assert!(err.to_string().contains("limit exceeds max"));

        let huge = "a".repeat(MAX_QUESTION_BYTES + 1);
        let err = call(&mut state, "ask", json!({ "question": huge }))
            .expect_err("oversized question must fail");
        assert!(err.to_string().contains("question exceeds max"));

        let tuple = json!({ "subject": "a", "predicate": "employs", "object": "b" });
        let batch = vec![tuple; MAX_INGEST_TUPLES + 1];
        let err = call(&mut state, "ingest", json!({ "tuples": batch }))
            .expect_err("oversized batch must fail");
        assert!(err.to_string().contains("batch size"));
    }

    #[test]
    fn unknown_method_is_a_jsonrpc_error() {
        let (mut state, _tmp) = temp_state();
        let resp = handle_request(
            &mut state,
            &json!({ "jsonrpc": "2.0", "id": 7, "method": "resources/list" }),
        )
        .unwrap();
        assert_eq!(resp["error"]["code"], -32601);

        let none = handle_request(
            &mut state,
            &json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }),
        );
        assert!(none.is_none());
    }
}

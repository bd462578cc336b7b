use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::fmt;
use std::path::PathBuf;
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::debug;

/// Prefix of the single stdout line carrying a shell script's JSON result.
pub const RESULT_MARKER: &str = "@@powercycle-result ";
pub const SEED_BATCH_SIZE: u64 = 10_000;
pub const SEED_MAX_STRING_LEN: u32 = 1024;

#[derive(Debug, Clone, Error)]
pub enum DbClientError {
    #[error("failed to run database shell: {0}")]
    Spawn(String),
    #[error("database shell exited with {code}: {output}")]
    Shell { code: i32, output: String },
    #[error("database shell printed no result line")]
    MissingResult { output: String },
    #[error("malformed result: {0}")]
    Malformed(String),
    #[error("command failed: {0}")]
    Command(String),
}

impl DbClientError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Spawn(_) => "spawn",
            Self::Shell { .. } => "shell-exit",
            Self::MissingResult { .. } => "missing-result",
            Self::Malformed(_) => "malformed",
            Self::Command(_) => "command-failed",
        }
    }
}

/// Marker document written before a crash and looked up after recovery.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanaryDocument(Map<String, Value>);

impl CanaryDocument {
    pub fn timestamped() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        let mut doc = Map::new();
        doc.insert("x".to_string(), json!(secs));
        Self(doc)
    }

    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn to_json(&self) -> String {
        Value::Object(self.0.clone()).to_string()
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl fmt::Display for CanaryDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_json())
    }
}

/// Feature compatibility version, `<major>.<minor>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompatVersion(semver::Version);

impl CompatVersion {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let trimmed = raw.trim();
        let (major, minor) = trimmed
            .split_once('.')
            .ok_or_else(|| format!("compat version '{trimmed}' must look like <major>.<minor>"))?;
        if major.is_empty()
            || minor.is_empty()
            || !major.chars().all(|ch| ch.is_ascii_digit())
            || !minor.chars().all(|ch| ch.is_ascii_digit())
        {
            return Err(format!("compat version '{trimmed}' must look like <major>.<minor>"));
        }
        semver::Version::parse(&format!("{major}.{minor}.0"))
            .map(Self)
            .map_err(|err| format!("compat version '{trimmed}': {err}"))
    }
}

impl fmt::Display for CompatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.0.major, self.0.minor)
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct CollectionValidation {
    pub namespace: String,
    pub valid: bool,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl CollectionValidation {
    /// Validation that could not run because the collection was in use.
    pub fn is_busy(&self) -> bool {
        self.errors
            .iter()
            .chain(self.warnings.iter())
            .any(|msg| msg.contains("EBUSY"))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct ValidationReport {
    pub collections: Vec<CollectionValidation>,
}

impl ValidationReport {
    pub fn invalid(&self) -> Vec<&str> {
        self.collections
            .iter()
            .filter(|c| !c.valid && !c.is_busy())
            .map(|c| c.namespace.as_str())
            .collect()
    }

    pub fn busy(&self) -> Vec<&str> {
        self.collections
            .iter()
            .filter(|c| c.is_busy())
            .map(|c| c.namespace.as_str())
            .collect()
    }

    pub fn is_valid(&self) -> bool {
        self.invalid().is_empty()
    }
}

pub trait DatabaseClient {
    /// `host:port` this client talks to.
    fn endpoint(&self) -> &str;

    fn ping(&self) -> Result<(), DbClientError>;
    fn server_info(&self) -> Result<Value, DbClientError>;
    fn shutdown(&self) -> Result<(), DbClientError>;
    /// Adds random documents until the collection holds `count`; returns the
    /// final document count.
    fn seed_documents(&self, db: &str, collection: &str, count: u64) -> Result<u64, DbClientError>;
    fn validate_collections(&self) -> Result<ValidationReport, DbClientError>;
    /// Journaled write.
    fn insert_canary(&self, db: &str, collection: &str, doc: &CanaryDocument) -> Result<(), DbClientError>;
    fn find_canary(&self, db: &str, collection: &str, doc: &CanaryDocument) -> Result<bool, DbClientError>;
    fn set_compat_version(&self, version: &CompatVersion) -> Result<(), DbClientError>;
    fn replset_config(&self) -> Result<Option<Value>, DbClientError>;
    fn replset_initiate(&self, config: &Value) -> Result<(), DbClientError>;
    fn replset_reconfig(&self, config: &Value, force: bool) -> Result<(), DbClientError>;
    fn is_primary(&self) -> Result<bool, DbClientError>;
}

/// Drives the legacy `mongo` shell with `--quiet --eval`.
pub struct MongoShellClient {
    shell: PathBuf,
    endpoint: String,
}

impl MongoShellClient {
    pub fn new(shell: PathBuf, host: &str, port: u16) -> Self {
        Self {
            shell,
            endpoint: format!("{host}:{port}"),
        }
    }

    /// Runs `body` as a function and returns its JSON result.
    fn eval(&self, body: &str) -> Result<Value, DbClientError> {
        let script = wrap_script(body);
        let mut cmd = Command::new(&self.shell);
        cmd.arg("--quiet").arg(&self.endpoint).arg("--eval").arg(&script);
        debug!("db-eval endpoint={} shell={}", self.endpoint, self.shell.display());

        let result = crate::run_command(cmd).map_err(DbClientError::Spawn)?;
        let output = result.combined();
        if !result.success() {
            return Err(DbClientError::Shell {
                code: result.code,
                output,
            });
        }
        parse_result_line(&result.stdout).ok_or(DbClientError::MissingResult { output })?
    }

    fn eval_ok(&self, body: &str) -> Result<Value, DbClientError> {
        let value = self.eval(body)?;
        check_ok(value)
    }
}

fn wrap_script(body: &str) -> String {
    format!(
        "var __result = (function() {{ {body} }})(); print('{marker}' + JSON.stringify(__result));",
        marker = RESULT_MARKER,
    )
}

fn parse_result_line(stdout: &str) -> Option<Result<Value, DbClientError>> {
    let line = stdout.lines().rev().find_map(|line| line.trim().strip_prefix(RESULT_MARKER))?;
    Some(serde_json::from_str(line).map_err(|err| DbClientError::Malformed(err.to_string())))
}

fn check_ok(value: Value) -> Result<Value, DbClientError> {
    let ok = value.get("ok").and_then(Value::as_f64).unwrap_or(0.0);
    if ok >= 1.0 {
        return Ok(value);
    }
    let message = value
        .get("errmsg")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| value.to_string());
    Err(DbClientError::Command(message))
}

fn js_string(raw: &str) -> String {
    Value::String(raw.to_string()).to_string()
}

impl DatabaseClient for MongoShellClient {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn ping(&self) -> Result<(), DbClientError> {
        self.eval_ok("return db.adminCommand({ping: 1});").map(|_| ())
    }

    fn server_info(&self) -> Result<Value, DbClientError> {
        self.eval_ok("return db.adminCommand({buildinfo: 1});")
    }

    fn shutdown(&self) -> Result<(), DbClientError> {
        let body = "try { db.getSiblingDB('admin').shutdownServer({force: true}); } catch (e) {} return {ok: 1};";
        match self.eval(body) {
            Ok(_) => Ok(()),
            // The connection drops as the server goes away.
            Err(DbClientError::Shell { .. } | DbClientError::MissingResult { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn seed_documents(&self, db: &str, collection: &str, count: u64) -> Result<u64, DbClientError> {
        let body = format!(
            "var coll = db.getSiblingDB({db}).getCollection({coll});
            var target = {count};
            function randomString(maxLen) {{
                var len = Math.floor(Math.random() * maxLen) + 1;
                var chars = 'ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789';
                var out = '';
                for (var i = 0; i < len; i++) {{ out += chars.charAt(Math.floor(Math.random() * chars.length)); }}
                return out;
            }}
            var have = coll.count();
            while (have < target) {{
                var batch = Math.min(target - have, {batch});
                var bulk = coll.initializeUnorderedBulkOp();
                for (var i = 0; i < batch; i++) {{ bulk.insert({{x: randomString({max_len})}}); }}
                bulk.execute();
                have = coll.count();
            }}
            return {{ok: 1, count: have}};",
            db = js_string(db),
            coll = js_string(collection),
            batch = SEED_BATCH_SIZE,
            max_len = SEED_MAX_STRING_LEN,
        );
        let value = self.eval_ok(&body)?;
        value
            .get("count")
            .and_then(Value::as_u64)
            .ok_or_else(|| DbClientError::Malformed(format!("seed result without count: {value}")))
    }

    fn validate_collections(&self) -> Result<ValidationReport, DbClientError> {
        let body = "var out = [];
            db.getMongo().getDBNames().forEach(function(dbName) {
                var d = db.getSiblingDB(dbName);
                d.getCollectionNames().forEach(function(name) {
                    var res = d.runCommand({validate: name, full: true});
                    out.push({namespace: dbName + '.' + name, valid: !!res.valid,
                              errors: res.errors || (res.ok ? [] : [res.errmsg || 'validate failed']),
                              warnings: res.warnings || []});
                });
            });
            return {ok: 1, collections: out};";
        let value = self.eval_ok(body)?;
        serde_json::from_value(value).map_err(|err| DbClientError::Malformed(err.to_string()))
    }

    fn insert_canary(&self, db: &str, collection: &str, doc: &CanaryDocument) -> Result<(), DbClientError> {
        let body = format!(
            "var res = db.getSiblingDB({db}).getCollection({coll}).insert({doc}, {{writeConcern: {{j: true}}}});
            if (res.hasWriteError() || res.hasWriteConcernError()) {{ return {{ok: 0, errmsg: tojson(res)}}; }}
            return {{ok: 1}};",
            db = js_string(db),
            coll = js_string(collection),
            doc = doc.to_json(),
        );
        self.eval_ok(&body).map(|_| ())
    }

    fn find_canary(&self, db: &str, collection: &str, doc: &CanaryDocument) -> Result<bool, DbClientError> {
        let body = format!(
            "return {{ok: 1, found: db.getSiblingDB({db}).getCollection({coll}).find({doc}).itcount() > 0}};",
            db = js_string(db),
            coll = js_string(collection),
            doc = doc.to_json(),
        );
        let value = self.eval_ok(&body)?;
        Ok(value.get("found").and_then(Value::as_bool).unwrap_or(false))
    }

    fn set_compat_version(&self, version: &CompatVersion) -> Result<(), DbClientError> {
        let body = format!(
            "return db.adminCommand({{setFeatureCompatibilityVersion: {}}});",
            js_string(&version.to_string())
        );
        self.eval_ok(&body).map(|_| ())
    }

    fn replset_config(&self) -> Result<Option<Value>, DbClientError> {
        let value = self.eval("return db.adminCommand({replSetGetConfig: 1});")?;
        if value.get("ok").and_then(Value::as_f64).unwrap_or(0.0) >= 1.0 {
            return Ok(value.get("config").cloned());
        }
        // NotYetInitialized
        if value.get("code").and_then(Value::as_i64) == Some(94) {
            return Ok(None);
        }
        check_ok(value).map(|_| None)
    }

    fn replset_initiate(&self, config: &Value) -> Result<(), DbClientError> {
        self.eval_ok(&format!("return db.adminCommand({{replSetInitiate: {config}}});"))
            .map(|_| ())
    }

    fn replset_reconfig(&self, config: &Value, force: bool) -> Result<(), DbClientError> {
        self.eval_ok(&format!(
            "return db.adminCommand({{replSetReconfig: {config}, force: {force}}});"
        ))
        .map(|_| ())
    }

    fn is_primary(&self) -> Result<bool, DbClientError> {
        let value = self.eval_ok("return db.adminCommand({isMaster: 1});")?;
        Ok(value.get("ismaster").and_then(Value::as_bool).unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canary_is_timestamped_and_serializable() {
        let doc = CanaryDocument::timestamped();
        let x = doc.fields().get("x").and_then(Value::as_f64).unwrap();
        assert!(x > 1_600_000_000.0);
        assert_eq!(CanaryDocument::parse(&doc.to_json()).unwrap(), doc);
        assert!(CanaryDocument::parse("[1]").is_err());
    }

    #[test]
    fn canary_timestamp_survives_text_round_trip_exactly() {
        for secs in [1792083165.0001237_f64, 1792083165.1641345, 1700000000.1 + 2e-7] {
            let mut fields = Map::new();
            fields.insert("x".to_string(), json!(secs));
            let doc = CanaryDocument(fields);
            let parsed = CanaryDocument::parse(&doc.to_string()).unwrap();
            let x = parsed.fields().get("x").and_then(Value::as_f64).unwrap();
            assert_eq!(x.to_bits(), secs.to_bits(), "sent={secs}");
        }
    }

    #[test]
    fn compat_version_accepts_major_minor_only() {
        assert_eq!(CompatVersion::parse("4.4").unwrap().to_string(), "4.4");
        assert_eq!(CompatVersion::parse(" 10.0 ").unwrap().to_string(), "10.0");
        assert!(CompatVersion::parse("4").is_err());
        assert!(CompatVersion::parse("4.4.1").is_err());
        assert!(CompatVersion::parse("v4.4").is_err());
        assert!(CompatVersion::parse("4.").is_err());
    }

    #[test]
    fn result_line_is_found_among_shell_noise() {
        let stdout = format!("some warning\n{RESULT_MARKER}{{\"ok\":1,\"found\":true}}\n");
        let value = parse_result_line(&stdout).unwrap().unwrap();
        assert_eq!(value["found"], json!(true));
        assert!(parse_result_line("nothing here\n").is_none());
        assert!(matches!(
            parse_result_line(&format!("{RESULT_MARKER}{{oops")),
            Some(Err(DbClientError::Malformed(_)))
        ));
    }

    #[test]
    fn command_errors_surface_errmsg() {
        let err = check_ok(json!({"ok": 0, "errmsg": "not master"})).unwrap_err();
        assert_eq!(err.kind(), "command-failed");
        assert!(err.to_string().contains("not master"));
        assert!(check_ok(json!({"ok": 1.0})).is_ok());
    }

    #[test]
    fn validation_separates_invalid_from_busy() {
        let report: ValidationReport = serde_json::from_value(json!({
            "collections": [
                {"namespace": "power.cycle", "valid": true},
                {"namespace": "power.broken", "valid": false, "errors": ["bad record"]},
                {"namespace": "local.oplog", "valid": false, "warnings": ["EBUSY: in use"]}
            ]
        }))
        .unwrap();

        assert_eq!(report.invalid(), vec!["power.broken"]);
        assert_eq!(report.busy(), vec!["local.oplog"]);
        assert!(!report.is_valid());
    }

    #[test]
    fn scripts_embed_names_as_string_literals() {
        assert_eq!(js_string("po'wer\""), "\"po'wer\\\"\"");
        let script = wrap_script("return {ok: 1};");
        assert!(script.contains(RESULT_MARKER));
        assert!(script.starts_with("var __result = (function() { return {ok: 1}; })();"));
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Debug, Default)]
    pub struct FakeDbState {
        pub calls: Vec<&'static str>,
        pub canaries: Vec<CanaryDocument>,
        pub documents: u64,
        pub invalid: Vec<String>,
        pub busy: Vec<String>,
        pub replset: Option<Value>,
        pub reconfigs: Vec<(Value, bool)>,
        /// `is_primary` answers false this many times first.
        pub primary_after: u32,
        pub ping_failures: u32,
        pub compat: Option<String>,
        pub failing: Vec<&'static str>,
    }

    /// In-memory database stand-in. Clones share state.
    #[derive(Clone, Default)]
    pub struct FakeDb {
        pub state: Rc<RefCell<FakeDbState>>,
    }

    impl FakeDb {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn calls(&self) -> Vec<&'static str> {
            self.state.borrow().calls.clone()
        }

        fn record(&self, call: &'static str) -> Result<(), DbClientError> {
            let mut state = self.state.borrow_mut();
            state.calls.push(call);
            if state.failing.contains(&call) {
                return Err(DbClientError::Command(format!("{call} failed")));
            }
            Ok(())
        }
    }

    impl DatabaseClient for FakeDb {
        fn endpoint(&self) -> &str {
            "localhost:0"
        }

        fn ping(&self) -> Result<(), DbClientError> {
            self.record("ping")?;
            let mut state = self.state.borrow_mut();
            if state.ping_failures > 0 {
                state.ping_failures -= 1;
                return Err(DbClientError::Shell {
                    code: 1,
                    output: "connect failed".into(),
                });
            }
            Ok(())
        }

        fn server_info(&self) -> Result<Value, DbClientError> {
            self.record("server_info")?;
            Ok(json!({"ok": 1, "version": "7.0.2"}))
        }

        fn shutdown(&self) -> Result<(), DbClientError> {
            self.record("shutdown")
        }

        fn seed_documents(&self, _db: &str, _collection: &str, count: u64) -> Result<u64, DbClientError> {
            self.record("seed_documents")?;
            let mut state = self.state.borrow_mut();
            state.documents = state.documents.max(count);
            Ok(state.documents)
        }

        fn validate_collections(&self) -> Result<ValidationReport, DbClientError> {
            self.record("validate_collections")?;
            let state = self.state.borrow();
            let mut collections = vec![CollectionValidation {
                namespace: "power.cycle".into(),
                valid: true,
                errors: Vec::new(),
                warnings: Vec::new(),
            }];
            for ns in &state.invalid {
                collections.push(CollectionValidation {
                    namespace: ns.clone(),
                    valid: false,
                    errors: vec!["corrupt".into()],
                    warnings: Vec::new(),
                });
            }
            for ns in &state.busy {
                collections.push(CollectionValidation {
                    namespace: ns.clone(),
                    valid: false,
                    errors: Vec::new(),
                    warnings: vec!["EBUSY".into()],
                });
            }
            Ok(ValidationReport { collections })
        }

        fn insert_canary(&self, _db: &str, _collection: &str, doc: &CanaryDocument) -> Result<(), DbClientError> {
            self.record("insert_canary")?;
            self.state.borrow_mut().canaries.push(doc.clone());
            Ok(())
        }

        fn find_canary(&self, _db: &str, _collection: &str, doc: &CanaryDocument) -> Result<bool, DbClientError> {
            self.record("find_canary")?;
            Ok(self.state.borrow().canaries.contains(doc))
        }

        fn set_compat_version(&self, version: &CompatVersion) -> Result<(), DbClientError> {
            self.record("set_compat_version")?;
            self.state.borrow_mut().compat = Some(version.to_string());
            Ok(())
        }

        fn replset_config(&self) -> Result<Option<Value>, DbClientError> {
            self.record("replset_config")?;
            Ok(self.state.borrow().replset.clone())
        }

        fn replset_initiate(&self, config: &Value) -> Result<(), DbClientError> {
            self.record("replset_initiate")?;
            self.state.borrow_mut().replset = Some(config.clone());
            Ok(())
        }

        fn replset_reconfig(&self, config: &Value, force: bool) -> Result<(), DbClientError> {
            self.record("replset_reconfig")?;
            let mut state = self.state.borrow_mut();
            state.replset = Some(config.clone());
            state.reconfigs.push((config.clone(), force));
            Ok(())
        }

        fn is_primary(&self) -> Result<bool, DbClientError> {
            self.record("is_primary")?;
            let mut state = self.state.borrow_mut();
            if state.primary_after > 0 {
                state.primary_after -= 1;
                return Ok(false);
            }
            Ok(true)
        }
    }
}

use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Flags understood by the target server binary. Anything else is rejected
/// at parse time instead of being forwarded blindly.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ServerFlag {
    DbPath,
    LogPath,
    LogAppend,
    Port,
    BindIp,
    Fork,
    ReplSet,
    NoJournal,
    StorageEngine,
    WiredTigerCacheSizeGb,
    JournalCommitInterval,
    SyncDelay,
    DirectoryPerDb,
    Auth,
    KeyFile,
    Quiet,
    Verbose,
    SetParameter(String),
}

impl ServerFlag {
    const NAMED: [ServerFlag; 17] = [
        ServerFlag::DbPath,
        ServerFlag::LogPath,
        ServerFlag::LogAppend,
        ServerFlag::Port,
        ServerFlag::BindIp,
        ServerFlag::Fork,
        ServerFlag::ReplSet,
        ServerFlag::NoJournal,
        ServerFlag::StorageEngine,
        ServerFlag::WiredTigerCacheSizeGb,
        ServerFlag::JournalCommitInterval,
        ServerFlag::SyncDelay,
        ServerFlag::DirectoryPerDb,
        ServerFlag::Auth,
        ServerFlag::KeyFile,
        ServerFlag::Quiet,
        ServerFlag::Verbose,
    ];

    pub fn name(&self) -> &str {
        match self {
            Self::DbPath => "dbpath",
            Self::LogPath => "logpath",
            Self::LogAppend => "logappend",
            Self::Port => "port",
            Self::BindIp => "bind_ip",
            Self::Fork => "fork",
            Self::ReplSet => "replSet",
            Self::NoJournal => "nojournal",
            Self::StorageEngine => "storageEngine",
            Self::WiredTigerCacheSizeGb => "wiredTigerCacheSizeGB",
            Self::JournalCommitInterval => "journalCommitInterval",
            Self::SyncDelay => "syncdelay",
            Self::DirectoryPerDb => "directoryperdb",
            Self::Auth => "auth",
            Self::KeyFile => "keyFile",
            Self::Quiet => "quiet",
            Self::Verbose => "verbose",
            Self::SetParameter(_) => "setParameter",
        }
    }

    pub fn takes_value(&self) -> bool {
        !matches!(
            self,
            Self::LogAppend
                | Self::Fork
                | Self::NoJournal
                | Self::DirectoryPerDb
                | Self::Auth
                | Self::Quiet
                | Self::Verbose
        )
    }

    fn from_name(raw: &str) -> Option<Self> {
        Self::NAMED.iter().find(|flag| flag.name() == raw).cloned()
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum OptionsError {
    #[error("unbalanced quote in server options")]
    UnbalancedQuote,
    #[error("unknown server option '{0}'")]
    UnknownFlag(String),
    #[error("server option '--{0}' requires a value")]
    MissingValue(String),
    #[error("server option '--{0}' does not take a value")]
    UnexpectedValue(String),
    #[error("setParameter expects name=value, got '{0}'")]
    InvalidSetParameter(String),
}

impl OptionsError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnbalancedQuote => "unbalanced-quote",
            Self::UnknownFlag(_) => "unknown-flag",
            Self::MissingValue(_) => "missing-value",
            Self::UnexpectedValue(_) => "unexpected-value",
            Self::InvalidSetParameter(_) => "invalid-set-parameter",
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ServerOptions {
    flags: BTreeMap<ServerFlag, Option<String>>,
}

impl ServerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a command-line fragment such as
    /// `--storageEngine wiredTiger --nojournal --setParameter a=b`.
    pub fn parse(raw: &str) -> Result<Self, OptionsError> {
        let words = shell_words::split(raw).map_err(|_| OptionsError::UnbalancedQuote)?;
        let mut out = Self::new();
        let mut iter = words.into_iter().peekable();

        while let Some(word) = iter.next() {
            let Some(body) = word.strip_prefix("--") else {
                return Err(OptionsError::UnknownFlag(word));
            };
            let (name, inline) = match body.split_once('=') {
                Some((name, value)) => (name.to_string(), Some(value.to_string())),
                None => (body.to_string(), None),
            };

            if name == "setParameter" {
                let value = match inline {
                    Some(value) => value,
                    None => iter
                        .next()
                        .ok_or_else(|| OptionsError::MissingValue(name.clone()))?,
                };
                let (param, param_value) = value
                    .split_once('=')
                    .filter(|(param, _)| !param.is_empty())
                    .ok_or_else(|| OptionsError::InvalidSetParameter(value.clone()))?;
                out.set(ServerFlag::SetParameter(param.to_string()), Some(param_value));
                continue;
            }

            let flag = ServerFlag::from_name(&name).ok_or_else(|| OptionsError::UnknownFlag(word.clone()))?;
            if !flag.takes_value() {
                if inline.is_some() {
                    return Err(OptionsError::UnexpectedValue(name));
                }
                out.set(flag, None::<String>);
                continue;
            }

            let value = match inline {
                Some(value) => value,
                None => match iter.peek() {
                    Some(next) if !next.starts_with("--") => iter.next().unwrap_or_default(),
                    _ => return Err(OptionsError::MissingValue(name)),
                },
            };
            out.set(flag, Some(value));
        }

        Ok(out)
    }

    pub fn set<S: Into<String>>(&mut self, flag: ServerFlag, value: Option<S>) {
        self.flags.insert(flag, value.map(Into::into));
    }

    pub fn remove(&mut self, flag: &ServerFlag) -> bool {
        self.flags.remove(flag).is_some()
    }

    pub fn contains(&self, flag: &ServerFlag) -> bool {
        self.flags.contains_key(flag)
    }

    pub fn value(&self, flag: &ServerFlag) -> Option<&str> {
        self.flags.get(flag).and_then(|value| value.as_deref())
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    /// Returns a copy of `self` where every flag present in `overrides`
    /// replaces the one already set.
    pub fn merged(&self, overrides: &ServerOptions) -> ServerOptions {
        let mut out = self.clone();
        for (flag, value) in &overrides.flags {
            out.flags.insert(flag.clone(), value.clone());
        }
        out
    }

    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.flags.len() * 2);
        for (flag, value) in &self.flags {
            args.push(format!("--{}", flag.name()));
            match (flag, value) {
                (ServerFlag::SetParameter(param), Some(value)) => args.push(format!("{param}={value}")),
                (_, Some(value)) => args.push(value.clone()),
                (_, None) => {}
            }
        }
        args
    }
}

impl fmt::Display for ServerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&shell_words::join(self.to_args()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_values_switches_and_parameters() {
        let opts = ServerOptions::parse(
            "--storageEngine wiredTiger --nojournal --wiredTigerCacheSizeGB=1 --setParameter enableTestCommands=1",
        )
        .unwrap();

        assert_eq!(opts.value(&ServerFlag::StorageEngine), Some("wiredTiger"));
        assert!(opts.contains(&ServerFlag::NoJournal));
        assert_eq!(opts.value(&ServerFlag::NoJournal), None);
        assert_eq!(opts.value(&ServerFlag::WiredTigerCacheSizeGb), Some("1"));
        assert_eq!(
            opts.value(&ServerFlag::SetParameter("enableTestCommands".into())),
            Some("1")
        );
    }

    #[test]
    fn rejects_unknown_and_malformed_flags() {
        assert_eq!(
            ServerOptions::parse("--bogus 1"),
            Err(OptionsError::UnknownFlag("--bogus".into()))
        );
        assert_eq!(
            ServerOptions::parse("--port"),
            Err(OptionsError::MissingValue("port".into()))
        );
        assert_eq!(
            ServerOptions::parse("--port --fork"),
            Err(OptionsError::MissingValue("port".into()))
        );
        assert_eq!(
            ServerOptions::parse("--fork=yes"),
            Err(OptionsError::UnexpectedValue("fork".into()))
        );
        assert_eq!(
            ServerOptions::parse("--setParameter nope"),
            Err(OptionsError::InvalidSetParameter("nope".into()))
        );
        assert_eq!(ServerOptions::parse("dbpath"), Err(OptionsError::UnknownFlag("dbpath".into())));
    }

    #[test]
    fn overrides_win_over_base_flags() {
        let base = ServerOptions::parse("--port 1234 --bind_ip 127.0.0.1 --nojournal").unwrap();
        let mut required = ServerOptions::new();
        required.set(ServerFlag::Port, Some("37017"));
        required.set(ServerFlag::BindIp, Some("0.0.0.0"));

        let merged = base.merged(&required);
        assert_eq!(merged.value(&ServerFlag::Port), Some("37017"));
        assert_eq!(merged.value(&ServerFlag::BindIp), Some("0.0.0.0"));
        assert!(merged.contains(&ServerFlag::NoJournal));
        assert_eq!(base.value(&ServerFlag::Port), Some("1234"));
    }

    #[test]
    fn renders_in_stable_order() {
        let opts = ServerOptions::parse("--fork --port 27017 --dbpath /data/db --setParameter a=b").unwrap();
        assert_eq!(
            opts.to_args(),
            vec!["--dbpath", "/data/db", "--port", "27017", "--fork", "--setParameter", "a=b"]
        );
    }

    #[test]
    fn display_output_parses_back() {
        let opts = ServerOptions::parse("--dbpath '/tmp/with space' --quiet").unwrap();
        assert_eq!(opts.value(&ServerFlag::DbPath), Some("/tmp/with space"));
        assert_eq!(ServerOptions::parse(&opts.to_string()).unwrap(), opts);
    }

    #[test]
    fn quoting_errors_and_comments() {
        assert_eq!(ServerOptions::parse("--dbpath '/tmp/open"), Err(OptionsError::UnbalancedQuote));
        let opts = ServerOptions::parse("--quiet # --fork").unwrap();
        assert!(opts.contains(&ServerFlag::Quiet));
        assert!(!opts.contains(&ServerFlag::Fork));
    }
}

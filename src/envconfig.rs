use crate::error::{Error, Result};
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use tracing::trace;

#[derive(Debug, Clone)]
enum Inherit {
    Remove(Vec<OsString>), // vars to remove (blacklist)
    None,                  // clear the environment
    Keep(Vec<OsString>),   // vars to keep (whitelist)
}
impl Default for Inherit {
    // Default to inheriting everything
    fn default() -> Self {
        Self::Remove(Vec::new())
    }
}
impl Inherit {
    fn clear(&mut self) -> &mut Self {
        *self = Self::None;
        self
    }
    fn remove(&mut self, k: impl Into<OsString>) -> &mut Self {
        match self {
            Self::None | Self::Keep(_) => {
                *self = Self::Remove(Vec::new());
                self.remove(k);
            }
            Self::Remove(list) => {
                list.push(k.into());
            }
        }
        self
    }
    fn keep(&mut self, k: impl Into<OsString>) -> &mut Self {
        match self {
            Self::None | Self::Remove(_) => {
                *self = Self::Keep(Vec::new());
                self.keep(k);
            }
            Self::Keep(list) => {
                list.push(k.into());
            }
        }
        self
    }
    // Returns the inherited part of `parent`. Pseudo-variables the OS
    // keeps in the block, such as the per-drive `=C:` entries on windows,
    // are not real names and are left out.
    fn environment<I>(&self, parent: I) -> EnvironmentHash
    where
        I: IntoIterator<Item = (OsString, OsString)>,
    {
        let mut env = EnvironmentHash::default();
        if let Self::None = self {
            return env;
        }
        for (k, v) in parent {
            if check_name(&k).is_err() {
                trace!(name = ?k, "skipping inherited pseudo-variable");
                continue;
            }
            let wanted = match self {
                Self::Remove(list) => !list.contains(&k),
                Self::Keep(list) => list.contains(&k),
                Self::None => false,
            };
            if wanted {
                _ = env.insert(k, v);
            }
        }
        env
    }
}

/// Constructs an environment. The builder sets a policy for inheriting
/// environment variables from the parent process, and allows setting
/// new variables and overriding existing values. Use `.realize()` to
/// get a value that can be used by [`ChildBuilder::set_env()`].
///
/// Example:
/// ```
/// # use chaperone::*;
/// # fn main() -> chaperone::Result<()> {
/// let mut env = envconfig::EnvironmentBuilder::new();
/// env.keep("HOME").keep("PATH").set("server_port", "1234");
///
/// let mut cmd = ChildBuilder::new("/usr/bin/env");
/// cmd.set_env(env.realize()?);
/// # Ok(()) }
/// ```
///
/// [`ChildBuilder::set_env()`]: crate::ChildBuilder::set_env
#[derive(Default)]
pub struct EnvironmentBuilder {
    inherit: Inherit,
    set: EnvironmentHash,
}
impl EnvironmentBuilder {
    /// Returns a new builder, with the policy to inherit the full
    /// environment of the parent process.
    pub fn new() -> Self {
        Self::default()
    }
    /// Validates the variables and produces an [`Environment`].
    /// Explicitly set variables override inherited ones.
    pub fn realize(self) -> Result<Environment> {
        self.realize_from(std::env::vars_os())
    }
    // Only the explicitly set variables can be rejected; inherited
    // entries that are not valid names were already dropped.
    fn realize_from<I>(self, parent: I) -> Result<Environment>
    where
        I: IntoIterator<Item = (OsString, OsString)>,
    {
        let set = Environment::from_pairs(self.set)?;
        let mut env = self.inherit.environment(parent);
        env.extend(set.vars);
        Environment::from_pairs(env)
    }
    /// Configures the child to start with a completely empty
    /// environment.
    pub fn clear(&mut self) -> &mut Self {
        self.inherit.clear();
        self
    }
    /// Sets a variable in the child process environment.
    pub fn set(&mut self, k: impl Into<OsString>, v: impl Into<OsString>) -> &mut Self {
        _ = self.set.insert(k.into(), v.into());
        self
    }
    /// Configures the child environment to inherit only those
    /// variables specified (whitelist policy).
    pub fn keep(&mut self, k: impl Into<OsString>) -> &mut Self {
        self.inherit.keep(k);
        self
    }
    /// Configures the child environment to inherit all variables
    /// except for those specified (blacklist policy).
    pub fn remove(&mut self, k: impl Into<OsString>) -> &mut Self {
        self.inherit.remove(k);
        self
    }
}

type EnvironmentHash = HashMap<OsString, OsString>;

/// A validated, complete process environment. Every name is non-empty
/// and free of `=` and NUL, every value is free of NUL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: Vec<(OsString, OsString)>,
}

impl Environment {
    /// Builds an environment from a name to value mapping. A repeated
    /// name keeps its last value.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        let mut vars = Vec::new();
        for (k, v) in pairs {
            let (k, v) = (k.into(), v.into());
            check_name(&k)?;
            if has_nul(&v) {
                return Err(Error::InvalidEnvironment(format!(
                    "value of {k:?} contains a NUL byte"
                )));
            }
            match vars.iter_mut().find(|(name, _)| *name == k) {
                Some(existing) => existing.1 = v,
                None => vars.push((k, v)),
            }
        }
        vars.sort();
        Ok(Self { vars })
    }

    /// Builds an environment from raw `NAME=VALUE` strings. The name ends
    /// at the first `=`; the value may contain further `=` characters.
    pub fn from_strings<I, S>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let pairs = entries
            .into_iter()
            .map(|entry| {
                let entry = entry.as_ref();
                entry
                    .split_once('=')
                    .map(|(k, v)| (k.to_owned(), v.to_owned()))
                    .ok_or_else(|| {
                        Error::InvalidEnvironment(format!("{entry:?} is not NAME=VALUE"))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        Self::from_pairs(pairs)
    }

    /// The parent's current environment.
    pub fn inherited() -> Result<Self> {
        EnvironmentBuilder::new().realize()
    }

    pub fn get(&self, name: impl AsRef<OsStr>) -> Option<&OsStr> {
        let name = name.as_ref();
        self.vars
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_os_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OsStr, &OsStr)> {
        self.vars.iter().map(|(k, v)| (k.as_os_str(), v.as_os_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

fn check_name(name: &OsStr) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidEnvironment("empty variable name".into()));
    }
    let lossy = name.to_string_lossy();
    if lossy.contains('=') {
        return Err(Error::InvalidEnvironment(format!(
            "name {lossy:?} contains '='"
        )));
    }
    if has_nul(name) {
        return Err(Error::InvalidEnvironment(format!(
            "name {lossy:?} contains a NUL byte"
        )));
    }
    Ok(())
}

fn has_nul(s: &OsStr) -> bool {
    s.to_string_lossy().contains('\0')
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn raw_strings_split_at_first_equals() {
        let env = Environment::from_strings(["A=1", "B=x=y", "C="]).unwrap();
        assert_eq!(env.get("A"), Some(OsStr::new("1")));
        assert_eq!(env.get("B"), Some(OsStr::new("x=y")));
        assert_eq!(env.get("C"), Some(OsStr::new("")));
        assert_eq!(env.len(), 3);
    }

    #[test]
    fn raw_string_without_equals_is_rejected() {
        let err = Environment::from_strings(["JUSTANAME"]).unwrap_err();
        assert!(matches!(err, Error::InvalidEnvironment(_)));
    }

    #[test]
    fn empty_name_in_mapping_is_rejected() {
        let err = Environment::from_pairs([("", "value")]).unwrap_err();
        assert!(matches!(err, Error::InvalidEnvironment(_)));
        let err = Environment::from_strings(["=value"]).unwrap_err();
        assert!(matches!(err, Error::InvalidEnvironment(_)));
    }

    #[test]
    fn nul_bytes_are_rejected() {
        assert!(Environment::from_pairs([("A", "x\0y")]).is_err());
        assert!(Environment::from_pairs([("A\0B", "x")]).is_err());
    }

    #[test]
    fn cleared_builder_holds_only_set_vars() {
        let mut builder = EnvironmentBuilder::new();
        builder.clear().set("ONLY", "this");
        let env = builder.realize().unwrap();
        assert_eq!(env.len(), 1);
        assert_eq!(env.get("ONLY"), Some(OsStr::new("this")));
    }

    #[test]
    fn keep_and_remove_policies() {
        std::env::set_var("CHAPERONE_ENV_KEEP_TEST", "kept");
        std::env::set_var("CHAPERONE_ENV_DROP_TEST", "dropped");

        let mut keep = EnvironmentBuilder::new();
        keep.keep("CHAPERONE_ENV_KEEP_TEST");
        let env = keep.realize().unwrap();
        assert_eq!(env.get("CHAPERONE_ENV_KEEP_TEST"), Some(OsStr::new("kept")));
        assert!(env.get("CHAPERONE_ENV_DROP_TEST").is_none());

        let mut remove = EnvironmentBuilder::new();
        remove.remove("CHAPERONE_ENV_DROP_TEST");
        let env = remove.realize().unwrap();
        assert!(env.get("CHAPERONE_ENV_KEEP_TEST").is_some());
        assert!(env.get("CHAPERONE_ENV_DROP_TEST").is_none());
    }

    #[test]
    fn set_overrides_inherited() {
        std::env::set_var("CHAPERONE_ENV_OVERRIDE_TEST", "parent");
        let mut builder = EnvironmentBuilder::new();
        builder.set("CHAPERONE_ENV_OVERRIDE_TEST", "child");
        let env = builder.realize().unwrap();
        assert_eq!(
            env.get("CHAPERONE_ENV_OVERRIDE_TEST"),
            Some(OsStr::new("child"))
        );
    }

    fn parent(vars: &[(&str, &str)]) -> Vec<(OsString, OsString)> {
        vars.iter().map(|(k, v)| (k.into(), v.into())).collect()
    }

    #[test]
    fn drive_cwd_entries_are_not_inherited() {
        let block = parent(&[
            ("=C:", r"C:\work"),
            ("=ExitCode", "00000000"),
            ("PATH", r"C:\bin"),
        ]);
        let env = EnvironmentBuilder::new().realize_from(block).unwrap();
        assert_eq!(env.len(), 1);
        assert_eq!(env.get("PATH"), Some(OsStr::new(r"C:\bin")));
    }

    #[test]
    fn pseudo_variables_do_not_break_keep_or_remove() {
        let block = parent(&[("=D:", r"D:\"), ("HOME", "/home/x"), ("TMP", "/tmp")]);
        let mut keep = EnvironmentBuilder::new();
        keep.keep("HOME");
        let env = keep.realize_from(block.clone()).unwrap();
        assert_eq!(env.len(), 1);

        let mut remove = EnvironmentBuilder::new();
        remove.remove("TMP");
        let env = remove.realize_from(block).unwrap();
        assert_eq!(env.get("HOME"), Some(OsStr::new("/home/x")));
        assert!(env.get("=D:").is_none());
    }

    #[test]
    fn explicit_bad_names_are_still_rejected() {
        let mut builder = EnvironmentBuilder::new();
        builder.set("=C:", "x");
        let err = builder.realize_from(Vec::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidEnvironment(_)));
    }

    proptest! {
        #[test]
        fn well_formed_names_are_accepted(name in "[A-Za-z_][A-Za-z0-9_]{0,16}", value in "[a-zA-Z0-9 =:/._-]{0,32}") {
            let env = Environment::from_pairs([(name.clone(), value.clone())]).unwrap();
            prop_assert_eq!(env.get(&name), Some(OsStr::new(&value)));
        }

        #[test]
        fn names_with_equals_are_rejected(head in "[A-Z]{0,4}", tail in "[A-Z]{0,4}") {
            let name = format!("{head}={tail}");
            prop_assert!(Environment::from_pairs([(name, "v")]).is_err());
        }
    }
}

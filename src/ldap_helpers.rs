//! LDAP Helper Utilities
//!
//! Extension trait for `SearchEntry` attribute extraction. Attribute names
//! are matched case-insensitively, since servers echo the schema spelling
//! rather than the requested one.

use ldap3::SearchEntry;

/// Extension trait for SearchEntry to simplify attribute extraction
pub(crate) trait SearchEntryExt {
    /// First value, or empty string if not found
    fn get_string_attr(&self, name: &str) -> String;

    /// First value (None if missing)
    fn get_optional_attr(&self, name: &str) -> Option<String>;

    /// All values for a multi-valued attribute
    fn get_multi_attr(&self, name: &str) -> Vec<String>;

    /// First binary value
    fn get_binary_attr(&self, name: &str) -> Option<Vec<u8>>;

    /// Values returned under a ranged name (`member;range=0-1499`).
    ///
    /// Returns the values and the start of the next range, `None` when the
    /// server marked this as the last chunk (`-*`). Falls back to the plain
    /// attribute, which always ends the walk.
    fn get_ranged_attr(&self, name: &str) -> Option<(Vec<String>, Option<u32>)>;
}

fn lookup<'a, V>(map: &'a std::collections::HashMap<String, V>, name: &str) -> Option<&'a V> {
    map.get(name).or_else(|| {
        map.iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    })
}

/// Parses the `a-b` or `a-*` suffix of a ranged attribute name.
fn parse_range(suffix: &str) -> Option<(u32, Option<u32>)> {
    let (start, end) = suffix.split_once('-')?;
    let start = start.parse().ok()?;
    let end = if end == "*" { None } else { Some(end.parse().ok()?) };
    Some((start, end))
}

impl SearchEntryExt for SearchEntry {
    fn get_string_attr(&self, name: &str) -> String {
        self.get_optional_attr(name).unwrap_or_default()
    }

    fn get_optional_attr(&self, name: &str) -> Option<String> {
        lookup(&self.attrs, name).and_then(|v| v.first()).cloned()
    }

    fn get_multi_attr(&self, name: &str) -> Vec<String> {
        lookup(&self.attrs, name).cloned().unwrap_or_default()
    }

    fn get_binary_attr(&self, name: &str) -> Option<Vec<u8>> {
        lookup(&self.bin_attrs, name)
            .and_then(|v| v.first())
            .cloned()
            .or_else(|| self.get_optional_attr(name).map(String::into_bytes))
    }

    fn get_ranged_attr(&self, name: &str) -> Option<(Vec<String>, Option<u32>)> {
        let prefix = format!("{};range=", name.to_ascii_lowercase());
        for (key, values) in &self.attrs {
            let lower = key.to_ascii_lowercase();
            if let Some(suffix) = lower.strip_prefix(&prefix) {
                let (_, end) = parse_range(suffix)?;
                return Some((values.clone(), end.map(|e| e + 1)));
            }
        }
        lookup(&self.attrs, name).map(|values| (values.clone(), None))
    }
}

/// Attribute names the store reads or writes directly
pub(crate) mod attrs {
    pub const OBJECT_CLASS: &str = "objectClass";
    pub const SN: &str = "sn";
    pub const CN: &str = "cn";
    pub const USER_PASSWORD: &str = "userPassword";

    // Active Directory
    pub const UNICODE_PWD: &str = "unicodePwd";
    pub const USER_ACCOUNT_CONTROL: &str = "userAccountControl";
}

//! LDAP Utilities
//!
//! RFC 4515 filter-value and RFC 4514 distinguished-name escaping. Untrusted
//! strings pass through here before they are interpolated into a filter or a
//! DN; the filter builder itself never escapes.

/// Escapes a string for safe use in an LDAP search filter (RFC 4515).
///
/// The following characters are escaped:
/// - `*` (asterisk) -> `\2a`
/// - `(` (left parenthesis) -> `\28`
/// - `)` (right parenthesis) -> `\29`
/// - `\` (backslash) -> `\5c`
/// - `\0` (NUL) -> `\00`
///
/// # Examples
///
/// ```
/// use ldap_identity_store::ldap_utils::escape_ldap_filter;
///
/// let safe = escape_ldap_filter("admin*");
/// assert_eq!(safe, "admin\\2a");
/// ```
pub fn escape_ldap_filter(input: &str) -> String {
    input.chars().fold(String::new(), |mut acc, c| {
        match c {
            '*' => acc.push_str("\\2a"),
            '(' => acc.push_str("\\28"),
            ')' => acc.push_str("\\29"),
            '\\' => acc.push_str("\\5c"),
            '\0' => acc.push_str("\\00"),
            _ => acc.push(c),
        }
        acc
    })
}

/// Filter escaping that keeps `*` as a substring wildcard.
///
/// A literal asterisk can still be expressed as `\*`, which becomes `\2a`.
pub fn escape_ldap_filter_keep_wildcards(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'*') => {
                chars.next();
                result.push_str("\\2a");
            }
            '\\' => result.push_str("\\5c"),
            '(' => result.push_str("\\28"),
            ')' => result.push_str("\\29"),
            '\0' => result.push_str("\\00"),
            _ => result.push(c),
        }
    }
    result
}

/// Escapes a string for safe use as an attribute value inside a DN (RFC 4514).
///
/// The following characters are escaped when they appear in a DN:
/// - `,` `+` `"` `\` `<` `>` `;`
/// - leading or trailing spaces
/// - `#` at the beginning
///
/// # Examples
///
/// ```
/// use ldap_identity_store::ldap_utils::escape_ldap_dn;
///
/// let safe = escape_ldap_dn("Smith, John");
/// assert_eq!(safe, "Smith\\, John");
/// ```
pub fn escape_ldap_dn(input: &str) -> String {
    if input.is_empty() {
        return String::new();
    }

    let mut result = String::with_capacity(input.len() * 2);
    let chars: Vec<char> = input.chars().collect();

    for (i, &c) in chars.iter().enumerate() {
        let is_first = i == 0;
        let is_last = i == chars.len() - 1;

        match c {
            ',' | '+' | '"' | '\\' | '<' | '>' | ';' => {
                result.push('\\');
                result.push(c);
            }
            ' ' if is_first || is_last => result.push_str("\\ "),
            '#' if is_first => result.push_str("\\#"),
            '\0' => result.push_str("\\00"),
            _ => result.push(c),
        }
    }

    result
}

/// Reverses DN value escaping, both `\c` and `\hh` forms.
pub fn unescape_ldap_dn(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 1 < bytes.len() {
            let hex = bytes
                .get(i + 1..i + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok());
            match hex {
                Some(b) => {
                    out.push(b);
                    i += 3;
                }
                None => {
                    out.push(bytes[i + 1]);
                    i += 2;
                }
            }
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Splits the leading RDN off a DN, honouring escaped commas.
///
/// Returns `(attribute, raw_value)` for the first RDN, or `None` when the DN
/// has no `attr=value` head.
pub fn leading_rdn(dn: &str) -> Option<(&str, &str)> {
    let mut escaped = false;
    let mut end = dn.len();
    for (i, c) in dn.char_indices() {
        match c {
            '\\' if !escaped => escaped = true,
            ',' if !escaped => {
                end = i;
                break;
            }
            _ => escaped = false,
        }
    }
    let rdn = &dn[..end];
    let (attr, value) = rdn.split_once('=')?;
    Some((attr.trim(), value.trim()))
}

/// Configuration-driven escaping switch.
///
/// Both escaping families can be disabled for directories that store
/// pre-escaped values; when disabled the input is returned unchanged.
#[derive(Debug, Clone, Copy)]
pub struct Escaper {
    filter_enabled: bool,
    dn_enabled: bool,
}

impl Escaper {
    pub fn new(filter_enabled: bool, dn_enabled: bool) -> Self {
        Self {
            filter_enabled,
            dn_enabled,
        }
    }

    pub fn filter_value(&self, input: &str) -> String {
        if self.filter_enabled {
            escape_ldap_filter(input)
        } else {
            input.to_string()
        }
    }

    pub fn filter_value_keep_wildcards(&self, input: &str) -> String {
        if self.filter_enabled {
            escape_ldap_filter_keep_wildcards(input)
        } else {
            input.to_string()
        }
    }

    pub fn dn_value(&self, input: &str) -> String {
        if self.dn_enabled {
            escape_ldap_dn(input)
        } else {
            input.to_string()
        }
    }
}

impl Default for Escaper {
    fn default() -> Self {
        Self::new(true, true)
    }
}

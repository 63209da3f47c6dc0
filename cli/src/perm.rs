//! Parsing of mode and owner arguments.

use std::ffi::CString;

use libc::{gid_t, uid_t};

const USER: u32 = 0o700;
const GROUP: u32 = 0o070;
const OTHER: u32 = 0o007;
const ALL: u32 = USER | GROUP | OTHER;

/// An argument that cannot be interpreted, reported with exit status 2
#[derive(Debug, thiserror::Error)]
#[error("invalid {what}: {value:?}")]
pub struct UsageError {
    pub what: &'static str,
    pub value: String,
}

impl UsageError {
    fn new(what: &'static str, value: &str) -> Self {
        Self {
            what,
            value: value.to_owned(),
        }
    }
}

/// A permission change: clear `andnot`, then set `or`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeChange {
    pub andnot: u32,
    pub or: u32,
}

impl ModeChange {
    pub fn apply(self, mode: u32) -> u32 {
        (mode & !self.andnot) | self.or
    }
}

fn class(bits: u32, mode: u32) -> u32 {
    if mode & bits != 0 {
        mode | bits
    } else {
        mode & !bits
    }
}

/// Parses an octal mode or a symbolic `[+-=][ugo]...` change
///
/// Classes are all or nothing: any bit set for a class grants it entirely.
pub fn parse_mode(text: &str) -> Result<ModeChange, UsageError> {
    if text.is_empty() {
        return Err(UsageError::new("mode", text));
    }

    if text.bytes().all(|b| (b'0'..=b'7').contains(&b)) {
        let mode = u32::from_str_radix(text, 8).map_err(|_| UsageError::new("mode", text))? & ALL;
        let or = [USER, GROUP, OTHER].into_iter().fold(mode, |mode, bits| class(bits, mode));
        return Ok(ModeChange { andnot: ALL, or });
    }

    let mut change = ModeChange { andnot: 0, or: 0 };
    let mut op = '=';
    for c in text.chars() {
        let bits = match c {
            '+' | '-' | '=' => {
                op = c;
                continue;
            }
            'u' => USER,
            'g' => GROUP,
            'o' => OTHER,
            _ => return Err(UsageError::new("mode", text)),
        };
        match op {
            '+' => {
                change.andnot |= bits;
                change.or |= bits;
            }
            '-' => {
                change.andnot |= bits;
                change.or &= !bits;
            }
            _ => {
                change.andnot |= ALL;
                change.or |= bits;
            }
        }
    }
    Ok(change)
}

fn numeric(text: &str) -> Option<u32> {
    if text.bytes().all(|b| b.is_ascii_digit()) {
        text.parse().ok()
    } else {
        None
    }
}

pub fn parse_uid(text: &str) -> Result<uid_t, UsageError> {
    if text.is_empty() || text.contains(':') {
        return Err(UsageError::new("user", text));
    }
    if let Some(uid) = numeric(text) {
        return Ok(uid);
    }

    let name = CString::new(text).map_err(|_| UsageError::new("user", text))?;
    // Safety: getpwnam returns null or a pointer into static storage
    let pwd = unsafe { libc::getpwnam(name.as_ptr()) };
    if pwd.is_null() {
        return Err(UsageError::new("user", text));
    }
    Ok(unsafe { (*pwd).pw_uid })
}

pub fn parse_gid(text: &str) -> Result<gid_t, UsageError> {
    if text.is_empty() || text.contains(':') {
        return Err(UsageError::new("group", text));
    }
    if let Some(gid) = numeric(text) {
        return Ok(gid);
    }

    let name = CString::new(text).map_err(|_| UsageError::new("group", text))?;
    // Safety: getgrnam returns null or a pointer into static storage
    let grp = unsafe { libc::getgrnam(name.as_ptr()) };
    if grp.is_null() {
        return Err(UsageError::new("group", text));
    }
    Ok(unsafe { (*grp).gr_gid })
}

/// Parses `owner[:group]`
pub fn parse_owner(text: &str) -> Result<(uid_t, Option<gid_t>), UsageError> {
    match text.split_once(':') {
        Some((user, group)) => Ok((parse_uid(user)?, Some(parse_gid(group)?))),
        None => Ok((parse_uid(text)?, None)),
    }
}

#[cfg(test)]
mod test {
    use super::{parse_gid, parse_mode, parse_owner, parse_uid, ModeChange};

    #[test]
    fn octal_modes() {
        assert_eq!(parse_mode("600").unwrap(), ModeChange { andnot: 0o777, or: 0o700 });
        assert_eq!(parse_mode("640").unwrap(), ModeChange { andnot: 0o777, or: 0o770 });
        assert_eq!(parse_mode("0").unwrap(), ModeChange { andnot: 0o777, or: 0 });
        assert_eq!(parse_mode("1777").unwrap().or, 0o777);
        assert!(parse_mode("").is_err());
        assert!(parse_mode("8").is_err());
    }

    #[test]
    fn symbolic_modes() {
        let change = parse_mode("+g").unwrap();
        assert_eq!(change.apply(0o600), 0o670);

        let change = parse_mode("-o").unwrap();
        assert_eq!(change.apply(0o607), 0o600);

        let change = parse_mode("=ug").unwrap();
        assert_eq!(change.apply(0o607), 0o770);

        // `=` is the default operation
        assert_eq!(parse_mode("u").unwrap(), parse_mode("=u").unwrap());

        let change = parse_mode("+go-g").unwrap();
        assert_eq!(change.apply(0o600), 0o607);

        assert!(parse_mode("+r").is_err());
        assert!(parse_mode("a=rw").is_err());
    }

    #[test]
    fn owners() {
        assert_eq!(parse_uid("0").unwrap(), 0);
        assert_eq!(parse_uid("root").unwrap(), 0);
        assert_eq!(parse_gid("1000").unwrap(), 1000);
        assert_eq!(parse_owner("12:34").unwrap(), (12, Some(34)));
        assert_eq!(parse_owner("12").unwrap(), (12, None));

        assert!(parse_uid("").is_err());
        assert!(parse_owner(":5").is_err());
        assert!(parse_owner("5:").is_err());
        assert!(parse_owner("1:2:3").is_err());
        assert!(parse_uid("no such user, surely").is_err());
        assert!(parse_gid("no such group, surely").is_err());
    }
}

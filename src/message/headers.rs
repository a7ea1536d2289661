//! Ordered, case-insensitive, multi-valued header container.

use indexmap::IndexMap;
use std::fmt;

use super::{date, Reader};
use crate::{Error, Result};

const ALLOWED_WARNINGS: &[&str] = &[
    "110 - Response is stale",
    "111 - Revalidation Failed",
    "112 - Disconnected Operation",
    "113 - Heuristic Expiration",
    "199 - Miscellaneous Warning",
    "214 - Transformation Applied",
    "299 - Miscellaneous Persistent Warning",
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderCollection {
    headers: Vec<(String, String)>,
}

impl HeaderCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<N, V, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (N, V)>,
        N: Into<String>,
        V: Into<String>,
    {
        let mut headers = Self::new();
        for (name, value) in pairs {
            headers.add(name, value);
        }
        headers
    }

    pub fn add<N: Into<String>, V: Into<String>>(&mut self, name: N, value: V) {
        self.headers.push((name.into(), value.into()));
    }

    /// Replaces the value of the first header called `name`, or appends a
    /// lowercased one.
    pub fn set<V: Into<String>>(&mut self, name: &str, value: V) {
        let value = value.into();
        match self.headers.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            Some(header) => header.1 = value,
            None => self.add(name.to_ascii_lowercase(), value),
        }
    }

    /// First value of `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn find_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn delete_all(&mut self, name: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Lowercased names in order, repeats included.
    pub fn keys(&self) -> Vec<String> {
        self.headers.iter().map(|(n, _)| n.to_ascii_lowercase()).collect()
    }

    pub fn items(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn clear(&mut self) {
        self.headers.clear();
    }

    /// Reads a header block terminated by an empty line; running out of
    /// input before that line is `Incomplete`. `is_h2` allows `:pseudo`
    /// header names.
    pub(crate) fn parse(reader: &mut Reader<'_>, is_h2: bool) -> Result<Self> {
        let mut headers = Self::new();
        let mut line = reader.read_line();
        while !(line == b"\r\n" || line == b"\n") {
            if line.last() != Some(&b'\n') {
                return Err(Error::incomplete("Incomplete headers field"));
            }
            let text = String::from_utf8_lossy(trim_eol(line)).into_owned();
            let (name, value) = split_header_line(&text, is_h2)?;
            let mut value = value.trim().to_string();

            line = reader.read_line();
            if !line.ends_with(b"\n") {
                return Err(Error::incomplete("Incomplete headers"));
            }
            while line.starts_with(b" ") || line.starts_with(b"\t") {
                value.push(' ');
                value.push_str(String::from_utf8_lossy(line).trim());
                line = reader.read_line();
            }
            headers.add(name.trim(), value);
        }
        Ok(headers)
    }

    pub(crate) fn as_lower_map(&self) -> IndexMap<String, Vec<String>> {
        let mut map: IndexMap<String, Vec<String>> = IndexMap::new();
        for (name, value) in &self.headers {
            map.entry(name.to_ascii_lowercase()).or_default().push(value.clone());
        }
        map
    }

    /// Checks `received` against `expected`, tolerating the header changes a
    /// forwarding proxy is allowed to make. `time_delta` is the tolerance in
    /// seconds for `Date`.
    pub fn compare(expected: &Self, received: &Self, time_delta: u64) -> std::result::Result<(), String> {
        let mut exp = expected.as_lower_map();
        let mut recv = received.as_lower_map();

        check_date(&mut exp, &mut recv, time_delta)?;
        check_age(&mut exp, &mut recv)?;
        check_connection(&mut exp, &mut recv)?;
        check_warning(&mut exp, &mut recv)?;

        let names: Vec<String> = exp.keys().chain(recv.keys()).cloned().collect();
        for name in names {
            if name == "expect" {
                continue;
            }
            let r = recv.get(&name);
            let e = exp.get(&name);
            if r != e {
                return Err(format!(
                    "Invalid header in headers or trailers.\nHeader name: \"{}\"\nReceived: {:?}\nExpected: {:?}",
                    name, r, e
                ));
            }
        }
        Ok(())
    }
}

fn trim_eol(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[..end]
}

fn split_header_line(line: &str, is_h2: bool) -> Result<(String, String)> {
    if is_h2 && line.starts_with(':') {
        let rest = &line[1..];
        return match rest.split_once(':') {
            Some((name, value)) => Ok((format!(":{}", name), value.to_string())),
            None => Ok((line.to_string(), String::new())),
        };
    }
    line.split_once(':')
        .map(|(n, v)| (n.to_string(), v.to_string()))
        .ok_or_else(|| Error::parse(format!("Invalid header format: [{}]", line)))
}

type LowerMap = IndexMap<String, Vec<String>>;

fn check_date(exp: &mut LowerMap, recv: &mut LowerMap, time_delta: u64) -> std::result::Result<(), String> {
    let single = |m: &LowerMap| m.get("date").map_or(false, |v| v.len() == 1);
    if !(single(exp) && single(recv)) {
        return Ok(());
    }
    let e = exp.shift_remove("date").unwrap_or_default().remove(0);
    let r = recv.shift_remove("date").unwrap_or_default().remove(0);
    let invalid = || format!("Header 'date' is invalid.\nReceived: {}.\nExpected: {}.", r, e);
    let ts_e = date::parse_http_date(&e).map_err(|_| invalid())?;
    let ts_r = date::parse_http_date(&r).map_err(|_| invalid())?;
    let half = time_delta as f64 / 2.0;
    let (ts_e, ts_r) = (ts_e as f64, ts_r as f64);
    if ts_r < ts_e - half || ts_r > ts_e + half {
        return Err(invalid());
    }
    Ok(())
}

fn check_age(exp: &mut LowerMap, recv: &mut LowerMap) -> std::result::Result<(), String> {
    let r_age = recv.shift_remove("age").unwrap_or_default();
    let e_age = exp.shift_remove("age").unwrap_or_default();
    let as_int = |v: &str| v.trim().parse::<i64>().map_err(|_| format!("Header 'age' is not a number: {}", v));

    if r_age.len() == 1 && e_age.len() == 1 {
        if as_int(&r_age[0])? < as_int(&e_age[0])? {
            return Err(format!("Header 'Age' is invalid.\nReceived: {:?}\nExpected: {:?}", r_age, e_age));
        }
    } else if !r_age.is_empty() {
        if r_age.len() > 1 {
            return Err("Proxy forwarded a response with several 'age' headers.".to_string());
        }
        let age = as_int(&r_age[0])?;
        if age < 0 {
            return Err(format!("Header 'age' is invalid.\nReceived: {}.", age));
        }
    }
    Ok(())
}

fn check_connection(exp: &mut LowerMap, recv: &mut LowerMap) -> std::result::Result<(), String> {
    let r = recv.shift_remove("connection").unwrap_or_default();
    let e = exp.shift_remove("connection").unwrap_or_default();

    if !r.is_empty() && !e.is_empty() {
        if r != e {
            return Err(format!("Invalid 'Connection' header.\nReceived: {:?}\nExpected: {:?}", r, e));
        }
        return Ok(());
    }
    if r.len() > 1 {
        return Err("Proxy forwarded a message with several 'Connection' headers.".to_string());
    }
    if let Some(value) = r.first() {
        if value != "close" && value != "keep-alive" {
            return Err(format!("Proxy forwarded a message with invalid 'Connection' header - {}.", value));
        }
    }
    Ok(())
}

fn check_warning(exp: &mut LowerMap, recv: &mut LowerMap) -> std::result::Result<(), String> {
    let r = recv.shift_remove("warning").unwrap_or_default();
    let e = exp.shift_remove("warning").unwrap_or_default();

    if !r.is_empty() && !e.is_empty() {
        if r != e {
            return Err(format!("Header 'Warning' is invalid.\nReceived: {:?}\nExpected: {:?}", r, e));
        }
    } else if let Some(bad) = r.iter().find(|w| !ALLOWED_WARNINGS.contains(&w.as_str())) {
        return Err(format!("Proxy added an invalid 'Warning' header - {}", bad));
    }
    Ok(())
}

impl fmt::Display for HeaderCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.headers {
            write!(f, "{}: {}\r\n", name, value)?;
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a HeaderCollection {
    type Item = &'a (String, String);
    type IntoIter = std::slice::Iter<'a, (String, String)>;

    fn into_iter(self) -> Self::IntoIter {
        self.headers.iter()
    }
}

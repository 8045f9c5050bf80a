//! conversion of client side queries into backend format.
//!
//! Client queries use `%s` / `%b` / `%t` positional or `%(name)s` named
//! placeholders. [`PostgresQuery::convert`] rewrites them into the `$N`
//! form the protocol wants, records the requested dump format of every
//! placeholder and, for named parameters, the order they appear in.

use std::collections::{BTreeMap, HashMap};

use memchr::memchr_iter;

use super::{
    adapt::PyFormat,
    errors::Error,
    sql::Composable,
    transform::{DumpedParams, Transformer},
    types::Value,
};

/// a query as accepted from the application.
#[derive(Debug, Clone)]
pub enum Query {
    Text(String),
    Sql(Composable),
}

impl From<&str> for Query {
    fn from(s: &str) -> Self {
        Query::Text(s.to_string())
    }
}

impl From<String> for Query {
    fn from(s: String) -> Self {
        Query::Text(s)
    }
}

impl From<Composable> for Query {
    fn from(c: Composable) -> Self {
        Query::Sql(c)
    }
}

/// query parameters: positional or named.
#[derive(Debug, Clone)]
pub enum Params {
    Positional(Vec<Value>),
    Named(BTreeMap<String, Value>),
}

impl Params {
    pub fn positional<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Params::Positional(values.into_iter().map(Into::into).collect())
    }

    pub fn named<'a, I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, V)>,
        V: Into<Value>,
    {
        Params::Named(
            values
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.into()))
                .collect(),
        )
    }
}

impl<V: Into<Value>> From<Vec<V>> for Params {
    fn from(values: Vec<V>) -> Self {
        Params::positional(values)
    }
}

enum Token {
    /// a byte range of plain query text
    Text(usize, usize),
    /// a literal `%`, written as `%%` in the source
    Percent,
    Placeholder {
        name: Option<String>,
        format: PyFormat,
    },
}

/// a converted query plus the adapted parameters of its last `dump`.
#[derive(Debug)]
pub(crate) struct PostgresQuery {
    pub(crate) query: Vec<u8>,
    pub(crate) params: Option<DumpedParams>,
    want_formats: Vec<PyFormat>,
    order: Option<Vec<String>>,
    nparams: usize,
}

impl PostgresQuery {
    /// rewrite *query* and adapt *params* through *tx*.
    ///
    /// queries executed without parameters are passed through untouched, so
    /// a lone `%` stays valid there, like in `select 10 % 3`.
    pub(crate) fn convert(
        query: &Query,
        params: Option<&Params>,
        tx: &mut Transformer,
    ) -> Result<Self, Error> {
        let raw = match query {
            Query::Text(text) => text.clone().into_bytes(),
            Query::Sql(composed) => composed.as_bytes(tx.adapters(), tx.session())?,
        };

        let mut pgq = if params.is_some() {
            let (converted, want_formats, order) = query_to_pg(&raw)?;
            PostgresQuery {
                query: converted,
                params: None,
                nparams: want_formats.len(),
                want_formats,
                order,
            }
        } else {
            PostgresQuery {
                query: raw,
                params: None,
                want_formats: Vec::new(),
                order: None,
                nparams: 0,
            }
        };
        if let Some(params) = params {
            pgq.dump(params, tx)?;
        }
        Ok(pgq)
    }

    /// re-adapt a new set of parameters against the already converted query.
    pub(crate) fn dump(&mut self, params: &Params, tx: &mut Transformer) -> Result<(), Error> {
        let values = validate_and_reorder(params, self.nparams, self.order.as_deref())?;
        self.params = Some(tx.dump_sequence(&values, &self.want_formats)?);
        Ok(())
    }

    /// oids of the parameters, the shape prepared statement keys use.
    pub(crate) fn types(&self) -> Vec<postgres_types::Oid> {
        self.params
            .as_ref()
            .map(|p| p.types.clone())
            .unwrap_or_default()
    }
}

fn validate_and_reorder(
    params: &Params,
    nparams: usize,
    order: Option<&[String]>,
) -> Result<Vec<Value>, Error> {
    match (params, order) {
        (Params::Positional(values), None) => {
            if values.len() != nparams {
                return Err(Error::programming(format!(
                    "the query has {nparams} placeholders but {} parameters were passed",
                    values.len()
                )));
            }
            Ok(values.clone())
        }
        (Params::Positional(_), Some(_)) => Err(Error::programming(
            "named placeholders require a mapping of parameters",
        )),
        (Params::Named(_), None) if nparams > 0 => Err(Error::programming(
            "positional placeholders (%s) require a sequence of parameters",
        )),
        (Params::Named(_), None) => Ok(Vec::new()),
        (Params::Named(map), Some(order)) => {
            let missing: Vec<&str> = order
                .iter()
                .filter(|name| !map.contains_key(*name))
                .map(String::as_str)
                .collect();
            if !missing.is_empty() {
                return Err(Error::programming(format!(
                    "query parameter missing: {}",
                    missing.join(", ")
                )));
            }
            Ok(order.iter().map(|name| map[name].clone()).collect())
        }
    }
}

type ConvertedQuery = (Vec<u8>, Vec<PyFormat>, Option<Vec<String>>);

/// rewrite `%s` style placeholders into `$N`, returning the requested
/// formats and, for named queries, the parameter order.
fn query_to_pg(query: &[u8]) -> Result<ConvertedQuery, Error> {
    let tokens = split_query(query)?;

    let named = tokens
        .iter()
        .any(|t| matches!(t, Token::Placeholder { name: Some(_), .. }));

    let mut out = Vec::with_capacity(query.len());
    let mut formats = Vec::new();
    let mut order = Vec::new();
    let mut seen: HashMap<String, (usize, PyFormat)> = HashMap::new();
    let mut index = 0;

    for token in &tokens {
        match token {
            Token::Text(start, end) => out.extend_from_slice(&query[*start..*end]),
            Token::Percent => out.push(b'%'),
            Token::Placeholder { name: None, format } => {
                index += 1;
                formats.push(*format);
                out.extend_from_slice(format!("${index}").as_bytes());
            }
            Token::Placeholder {
                name: Some(name),
                format,
            } => match seen.get(name) {
                Some(&(n, first_format)) => {
                    if first_format != *format {
                        return Err(Error::programming(format!(
                            "placeholder '{name}' cannot have different formats"
                        )));
                    }
                    out.extend_from_slice(format!("${n}").as_bytes());
                }
                None => {
                    index += 1;
                    seen.insert(name.clone(), (index, *format));
                    order.push(name.clone());
                    formats.push(*format);
                    out.extend_from_slice(format!("${index}").as_bytes());
                }
            },
        }
    }

    Ok((out, formats, if named { Some(order) } else { None }))
}

/// split a query around its placeholders, validating them.
fn split_query(query: &[u8]) -> Result<Vec<Token>, Error> {
    let mut tokens = Vec::new();
    let mut cursor = 0;
    let mut named: Option<bool> = None;

    for pos in memchr_iter(b'%', query) {
        if pos < cursor {
            // part of an already consumed placeholder
            continue;
        }
        if pos > cursor {
            tokens.push(Token::Text(cursor, pos));
        }
        match query.get(pos + 1).copied() {
            Some(b'%') => {
                tokens.push(Token::Percent);
                cursor = pos + 2;
            }
            Some(b'(') => {
                let close = memchr::memchr(b')', &query[pos + 2..]).map(|i| pos + 2 + i);
                let Some(close) = close else {
                    return Err(incomplete_placeholder(query, pos));
                };
                let Some(fmt) = query.get(close + 1).copied() else {
                    return Err(incomplete_placeholder(query, pos));
                };
                let format = format_of(fmt, query, pos)?;
                let name = String::from_utf8(query[pos + 2..close].to_vec())
                    .map_err(|_| incomplete_placeholder(query, pos))?;
                if named.replace(true) == Some(false) {
                    return Err(mixed_placeholders());
                }
                tokens.push(Token::Placeholder {
                    name: Some(name),
                    format,
                });
                cursor = close + 2;
            }
            Some(b' ') | None => {
                return Err(Error::programming(
                    "incomplete placeholder: '%'; if you want to use '%' as an operator \
                     you can double it up, i.e. use '%%'",
                ));
            }
            Some(fmt) => {
                let format = format_of(fmt, query, pos)?;
                if named.replace(false) == Some(true) {
                    return Err(mixed_placeholders());
                }
                tokens.push(Token::Placeholder { name: None, format });
                cursor = pos + 2;
            }
        }
    }
    if cursor < query.len() {
        tokens.push(Token::Text(cursor, query.len()));
    }
    Ok(tokens)
}

fn format_of(f: u8, query: &[u8], pos: usize) -> Result<PyFormat, Error> {
    match f {
        b's' => Ok(PyFormat::Auto),
        b't' => Ok(PyFormat::Text),
        b'b' => Ok(PyFormat::Binary),
        _ => {
            let tail: Vec<u8> = query[pos..].iter().take(4).copied().collect();
            Err(Error::programming(format!(
                "only '%s', '%b', '%t' placeholders allowed, got {}",
                String::from_utf8_lossy(&tail)
            )))
        }
    }
}

#[cold]
fn incomplete_placeholder(query: &[u8], pos: usize) -> Error {
    let tail = &query[pos..];
    let upto = tail
        .iter()
        .position(|b| b.is_ascii_whitespace())
        .unwrap_or(tail.len());
    Error::programming(format!(
        "incomplete placeholder: '{}'",
        String::from_utf8_lossy(&tail[..upto])
    ))
}

#[cold]
fn mixed_placeholders() -> Error {
    Error::programming("positional and named placeholders cannot be mixed")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::adapt::SessionInfo;
    use crate::pq::Format;
    use crate::types::default_adapters;
    use std::sync::Arc;

    fn tx() -> Transformer {
        Transformer::new(Arc::new(default_adapters()), SessionInfo::default())
    }

    fn convert(query: &str, params: Params) -> PostgresQuery {
        PostgresQuery::convert(&Query::from(query), Some(&params), &mut tx()).unwrap()
    }

    fn convert_err(query: &str, params: Params) -> Error {
        PostgresQuery::convert(&Query::from(query), Some(&params), &mut tx()).unwrap_err()
    }

    #[test]
    fn positional_placeholders_become_dollar_n() {
        let pgq = convert("select %s, %b, %t", Params::positional([1i32, 2i32, 3i32]));
        assert_eq!(pgq.query, b"select $1, $2, $3".to_vec());
        let params = pgq.params.unwrap();
        assert_eq!(params.formats, vec![Format::Text, Format::Binary, Format::Text]);
    }

    #[test]
    fn named_placeholders_are_deduplicated_and_ordered() {
        let pgq = convert(
            "select %(b)s, %(a)s, %(b)s",
            Params::named([("a", 1i32), ("b", 2i32)]),
        );
        assert_eq!(pgq.query, b"select $1, $2, $1".to_vec());
        assert_eq!(pgq.order.as_deref().unwrap(), ["b".to_string(), "a".to_string()]);
        let params = pgq.params.unwrap();
        // values follow the order of first appearance: b first
        assert_eq!(params.params[0], Some(b"2".to_vec()));
        assert_eq!(params.params[1], Some(b"1".to_vec()));
    }

    #[test]
    fn double_percent_is_unescaped() {
        let pgq = convert("select '%%' || %s", Params::positional([1i32]));
        assert_eq!(pgq.query, b"select '%' || $1".to_vec());
    }

    #[test]
    fn without_params_query_is_untouched() {
        let pgq =
            PostgresQuery::convert(&Query::from("select 10 % 3"), None, &mut tx()).unwrap();
        assert_eq!(pgq.query, b"select 10 % 3".to_vec());
        assert!(pgq.params.is_none());
    }

    #[test]
    fn bad_placeholders_are_rejected() {
        let e = convert_err("select %x", Params::positional([1i32]));
        assert!(e.to_string().contains("only '%s', '%b', '%t'"));

        let e = convert_err("select %(name", Params::positional([1i32]));
        assert!(e.to_string().contains("incomplete placeholder"));

        let e = convert_err("select 10 % 3", Params::positional(Vec::<i32>::new()));
        assert!(e.to_string().contains("double it up"));

        let e = convert_err("select %s, %(a)s", Params::positional([1i32]));
        assert!(e.to_string().contains("cannot be mixed"));
    }

    #[test]
    fn wrong_parameter_counts_are_rejected() {
        let e = convert_err("select %s, %s", Params::positional([1i32]));
        assert!(e.to_string().contains("2 placeholders but 1 parameters"));

        let e = convert_err("select %(a)s", Params::named([("b", 1i32)]));
        assert!(e.to_string().contains("query parameter missing: a"));

        let e = convert_err("select %s", Params::named([("a", 1i32)]));
        assert!(e.to_string().contains("require a sequence"));
    }

    #[test]
    fn different_formats_for_same_name_are_rejected() {
        let e = convert_err(
            "select %(a)s, %(a)b",
            Params::named([("a", 1i32)]),
        );
        assert!(e.to_string().contains("cannot have different formats"));
    }
}

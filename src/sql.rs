//! safe composition of SQL snippets.
//!
//! The building blocks are a tagged sum type: raw [`sql`] snippets,
//! [`identifier`]s escaped per the quoting rules, client side adapted
//! [`literal`]s, [`placeholder`]s that survive into the query conversion,
//! and [`Composable::join`]ed sequences. Everything renders through a
//! single [`Composable::as_bytes`] entry point.

use std::sync::Arc;

use super::{
    adapt::{AdaptersMap, DumpContext, Dumper, PyFormat, SessionInfo},
    errors::Error,
    types::Value,
};

/// one composable piece of a SQL statement.
#[derive(Debug, Clone)]
pub enum Composable {
    Sql(String),
    Identifier(Vec<String>),
    Literal(Value),
    Placeholder {
        name: Option<String>,
        format: PyFormat,
    },
    Composed(Vec<Composable>),
}

/// a snippet of SQL trusted to be safe, with `{}` / `{name}` format slots.
pub fn sql(text: impl Into<String>) -> Composable {
    Composable::Sql(text.into())
}

/// a possibly dotted identifier, each part quoted on rendering.
pub fn identifier<I, S>(parts: I) -> Composable
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Composable::Identifier(parts.into_iter().map(Into::into).collect())
}

/// a value rendered inline through its dumper's quoted form.
pub fn literal(value: impl Into<Value>) -> Composable {
    Composable::Literal(value.into())
}

/// a `%s` placeholder surviving composition.
pub fn placeholder() -> Composable {
    Composable::Placeholder {
        name: None,
        format: PyFormat::Auto,
    }
}

/// a `%(name)s` placeholder surviving composition.
pub fn named_placeholder(name: impl Into<String>, format: PyFormat) -> Composable {
    Composable::Placeholder {
        name: Some(name.into()),
        format,
    }
}

impl Composable {
    /// substitute `{}` and `{name}` slots of a [`sql`] snippet.
    ///
    /// positional slots consume *args* in order; named slots look into
    /// *kwargs*. `{{` and `}}` render literal braces.
    pub fn format(
        &self,
        args: Vec<Composable>,
        kwargs: &[(&str, Composable)],
    ) -> Result<Composable, Error> {
        let Composable::Sql(template) = self else {
            return Err(Error::programming("only sql() snippets can be formatted"));
        };

        let mut out = Vec::new();
        let mut text = String::new();
        let mut args = args.into_iter();
        let mut chars = template.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    text.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    text.push('}');
                }
                '}' => return Err(Error::programming("single '}' encountered in format string")),
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(c) => name.push(c),
                            None => {
                                return Err(Error::programming(
                                    "single '{' encountered in format string",
                                ))
                            }
                        }
                    }
                    if !text.is_empty() {
                        out.push(Composable::Sql(std::mem::take(&mut text)));
                    }
                    if name.is_empty() {
                        let arg = args.next().ok_or_else(|| {
                            Error::programming("not enough arguments for format string")
                        })?;
                        out.push(arg);
                    } else {
                        let arg = kwargs
                            .iter()
                            .find(|(k, _)| *k == name)
                            .map(|(_, v)| v.clone())
                            .ok_or_else(|| {
                                Error::programming(format!("format argument {name:?} missing"))
                            })?;
                        out.push(arg);
                    }
                }
                c => text.push(c),
            }
        }
        if !text.is_empty() {
            out.push(Composable::Sql(text));
        }
        Ok(Composable::Composed(out))
    }

    /// interleave *items* with `self` as the separator.
    pub fn join(&self, items: Vec<Composable>) -> Composable {
        let mut out = Vec::with_capacity(items.len() * 2);
        for (i, item) in items.into_iter().enumerate() {
            if i > 0 {
                out.push(self.clone());
            }
            out.push(item);
        }
        Composable::Composed(out)
    }

    /// render to query bytes against the session's adapters.
    pub fn as_bytes(
        &self,
        adapters: &Arc<AdaptersMap>,
        session: &SessionInfo,
    ) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        self.render(adapters, session, &mut out)?;
        Ok(out)
    }

    pub fn as_string(
        &self,
        adapters: &Arc<AdaptersMap>,
        session: &SessionInfo,
    ) -> Result<String, Error> {
        let bytes = self.as_bytes(adapters, session)?;
        String::from_utf8(bytes).map_err(|_| Error::internal("composed query is not valid utf-8"))
    }

    fn render(
        &self,
        adapters: &Arc<AdaptersMap>,
        session: &SessionInfo,
        out: &mut Vec<u8>,
    ) -> Result<(), Error> {
        match self {
            Composable::Sql(text) => out.extend_from_slice(text.as_bytes()),
            Composable::Identifier(parts) => {
                if parts.is_empty() {
                    return Err(Error::programming("identifier cannot be empty"));
                }
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        out.push(b'.');
                    }
                    quote_identifier(part, out);
                }
            }
            Composable::Literal(value) => {
                let cx = DumpContext { session, adapters };
                let dumper = adapters
                    .get_dumper(value.kind(), PyFormat::Text)
                    .or_else(|_| adapters.get_dumper(value.kind(), PyFormat::Auto))?;
                let dumper = dumper.upgrade(value, PyFormat::Text, &cx).unwrap_or(dumper);
                out.extend_from_slice(&dumper.quote(value, &cx)?);
            }
            Composable::Placeholder { name, format } => {
                let suffix = match format {
                    PyFormat::Auto => 's',
                    PyFormat::Text => 't',
                    PyFormat::Binary => 'b',
                };
                match name {
                    Some(name) => out.extend_from_slice(format!("%({name}){suffix}").as_bytes()),
                    None => out.extend_from_slice(format!("%{suffix}").as_bytes()),
                }
            }
            Composable::Composed(items) => {
                for item in items {
                    item.render(adapters, session, out)?;
                }
            }
        }
        Ok(())
    }
}

/// double any embedded quote and wrap, per the identifier quoting rules.
fn quote_identifier(part: &str, out: &mut Vec<u8>) {
    out.push(b'"');
    for b in part.bytes() {
        if b == b'"' {
            out.push(b'"');
        }
        out.push(b);
    }
    out.push(b'"');
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::default_adapters;

    fn render(c: &Composable) -> String {
        let adapters = Arc::new(default_adapters());
        c.as_string(&adapters, &SessionInfo::default()).unwrap()
    }

    #[test]
    fn identifiers_are_quoted() {
        let c = identifier(["schema", "we\"ird"]);
        assert_eq!(render(&c), r#""schema"."we""ird""#);
    }

    #[test]
    fn literals_go_through_dumpers() {
        assert_eq!(render(&literal("o'clock")), "'o''clock'");
        assert_eq!(render(&literal(42i32)), "42");
        assert_eq!(render(&literal(true)), "true");
    }

    #[test]
    fn format_substitutes_by_position_and_name() {
        let c = sql("insert into {} ({field}) values ({})")
            .format(
                vec![identifier(["tbl"]), placeholder()],
                &[("field", identifier(["name"]))],
            )
            .unwrap();
        assert_eq!(render(&c), r#"insert into "tbl" ("name") values (%s)"#);
    }

    #[test]
    fn join_interleaves_separator() {
        let c = sql(", ").join(vec![literal(1i32), literal(2i32), literal(3i32)]);
        assert_eq!(render(&c), "1, 2, 3");
    }

    #[test]
    fn braces_escape() {
        let c = sql("select '{{}}'").format(vec![], &[]).unwrap();
        assert_eq!(render(&c), "select '{}'");
    }

    #[test]
    fn missing_arguments_error() {
        assert!(sql("{}").format(vec![], &[]).is_err());
        assert!(sql("{x}").format(vec![], &[]).is_err());
        assert!(sql("}").format(vec![], &[]).is_err());
    }
}

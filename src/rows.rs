//! result rows with positional and named access.

use std::{collections::BTreeMap, sync::Arc};

use super::{column::Column, errors::Error, types::Value};

/// one row of a result set.
///
/// values are reachable by position or by column name, which covers the
/// tuple and mapping shapes most applications want; anything fancier is an
/// iterator adapter away.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    values: Vec<Value>,
    columns: Arc<[Column]>,
}

impl Row {
    pub(crate) fn new(values: Vec<Value>, columns: Arc<[Column]>) -> Self {
        Self { values, columns }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// value at *index*; errors on an index out of range.
    pub fn get(&self, index: usize) -> Result<&Value, Error> {
        self.values
            .get(index)
            .ok_or_else(|| Error::interface(format!("no column with index {index}")))
    }

    /// value of the first column named *name*.
    pub fn get_named(&self, name: &str) -> Result<&Value, Error> {
        let index = self
            .columns
            .iter()
            .position(|c| c.name() == name)
            .ok_or_else(|| Error::interface(format!("no column named {name:?}")))?;
        self.get(index)
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.values.iter()
    }
}

impl IntoIterator for Row {
    type Item = Value;
    type IntoIter = std::vec::IntoIter<Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.into_iter()
    }
}

/// the plain tuple shape of a row.
pub fn tuple_row(row: Row) -> Vec<Value> {
    row.into_values()
}

/// the mapping shape of a row, keyed by column name.
pub fn map_row(row: Row) -> BTreeMap<String, Value> {
    let names: Vec<String> = row.columns().iter().map(|c| c.name().to_string()).collect();
    names.into_iter().zip(row.into_values()).collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pq::mock::{MockColumn, MockResult};
    use postgres_types::Type;

    fn sample() -> Row {
        let result = MockResult::tuples(
            vec![
                MockColumn::new("id", &Type::INT4),
                MockColumn::new("name", &Type::TEXT),
            ],
            Vec::new(),
        );
        let columns: Arc<[Column]> = (0..2)
            .map(|i| Column::from_result(&result, i))
            .collect::<Vec<_>>()
            .into();
        Row::new(vec![Value::Int(7), Value::Text("ada".into())], columns)
    }

    #[test]
    fn positional_and_named_access_agree() {
        let row = sample();
        assert_eq!(row.get(0).unwrap(), &Value::Int(7));
        assert_eq!(row.get_named("name").unwrap(), &Value::Text("ada".into()));
        assert!(row.get(2).is_err());
        assert!(row.get_named("missing").is_err());
    }

    #[test]
    fn map_row_keys_by_column_name() {
        let map = map_row(sample());
        assert_eq!(map["id"], Value::Int(7));
        assert_eq!(map["name"], Value::Text("ada".into()));
    }
}

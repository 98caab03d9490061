use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// A categorical value or integer identifier.
pub type Code = i64;

/// An in-memory columnar table. Every column has exactly `len` entries. Categorical attributes and
/// identifiers live in `codes`; weights and other real values live in `reals`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    len: usize,
    codes: BTreeMap<String, Vec<Code>>,
    reals: BTreeMap<String, Vec<f64>>,
}

impl Table {
    pub fn new(len: usize) -> Table {
        Table {
            len,
            codes: BTreeMap::new(),
            reals: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn with_codes<S: Into<String>>(mut self, name: S, values: Vec<Code>) -> Result<Table> {
        self.set_codes(name, values)?;
        Ok(self)
    }

    pub fn with_reals<S: Into<String>>(mut self, name: S, values: Vec<f64>) -> Result<Table> {
        self.set_reals(name, values)?;
        Ok(self)
    }

    /// Adds or replaces a categorical column.
    pub fn set_codes<S: Into<String>>(&mut self, name: S, values: Vec<Code>) -> Result<()> {
        let name = name.into();
        if values.len() != self.len {
            bail!(
                "column {} has {} values, but the table has {} rows",
                name,
                values.len(),
                self.len
            );
        }
        self.codes.insert(name, values);
        Ok(())
    }

    /// Adds or replaces a real-valued column.
    pub fn set_reals<S: Into<String>>(&mut self, name: S, values: Vec<f64>) -> Result<()> {
        let name = name.into();
        if values.len() != self.len {
            bail!(
                "column {} has {} values, but the table has {} rows",
                name,
                values.len(),
                self.len
            );
        }
        self.reals.insert(name, values);
        Ok(())
    }

    pub fn codes(&self, name: &str) -> Result<&[Code]> {
        match self.codes.get(name) {
            Some(values) => Ok(values),
            None => bail!("no categorical column {} (have {:?})", name, self.columns()),
        }
    }

    pub fn reals(&self, name: &str) -> Result<&[f64]> {
        match self.reals.get(name) {
            Some(values) => Ok(values),
            None => bail!("no real column {} (have {:?})", name, self.columns()),
        }
    }

    pub fn has_codes(&self, name: &str) -> bool {
        self.codes.contains_key(name)
    }

    pub fn has_reals(&self, name: &str) -> bool {
        self.reals.contains_key(name)
    }

    pub fn code_columns(&self) -> impl Iterator<Item = &str> {
        self.codes.keys().map(|x| x.as_str())
    }

    /// All column names, categorical and real, sorted.
    pub fn columns(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .codes
            .keys()
            .chain(self.reals.keys())
            .map(|x| x.as_str())
            .collect();
        names.sort_unstable();
        names
    }

    pub fn remove(&mut self, name: &str) {
        self.codes.remove(name);
        self.reals.remove(name);
    }

    /// A new table holding the given rows, in the given order. Rows may repeat.
    pub fn take(&self, rows: &[usize]) -> Table {
        Table {
            len: rows.len(),
            codes: self
                .codes
                .iter()
                .map(|(name, values)| (name.clone(), rows.iter().map(|r| values[*r]).collect()))
                .collect(),
            reals: self
                .reals
                .iter()
                .map(|(name, values)| (name.clone(), rows.iter().map(|r| values[*r]).collect()))
                .collect(),
        }
    }

    /// Keep only the rows where the mask is set.
    pub fn filter(&self, mask: &[bool]) -> Table {
        assert_eq!(mask.len(), self.len);
        self.take(&crate::filters::selected(mask))
    }

    /// Stack tables with identical schemas.
    pub fn concat(tables: Vec<Table>) -> Result<Table> {
        let mut iter = tables.into_iter();
        let mut result = match iter.next() {
            Some(t) => t,
            None => return Ok(Table::new(0)),
        };
        for table in iter {
            if !table.codes.keys().eq(result.codes.keys())
                || !table.reals.keys().eq(result.reals.keys())
            {
                bail!(
                    "can't concatenate tables with columns {:?} and {:?}",
                    result.columns(),
                    table.columns()
                );
            }
            result.len += table.len;
            // Same keys, so both maps iterate in the same order
            for (column, more) in result.codes.values_mut().zip(table.codes.into_values()) {
                column.extend(more);
            }
            for (column, more) in result.reals.values_mut().zip(table.reals.into_values()) {
                column.extend(more);
            }
        }
        Ok(result)
    }

    /// Sorted distinct values of a categorical column.
    pub fn distinct(&self, name: &str) -> Result<Vec<Code>> {
        let values: BTreeSet<Code> = self.codes(name)?.iter().cloned().collect();
        Ok(values.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn people() -> Table {
        Table::new(4)
            .with_codes("person_id", vec![1, 2, 3, 4])
            .unwrap()
            .with_codes("sex", vec![0, 1, 1, 0])
            .unwrap()
            .with_reals("weight", vec![1.0, 2.0, 3.0, 4.0])
            .unwrap()
    }

    #[test]
    fn lengths_are_checked() {
        assert!(Table::new(2).with_codes("x", vec![1, 2, 3]).is_err());
        assert!(Table::new(2).with_reals("x", vec![1.0]).is_err());
        assert!(people().codes("missing").is_err());
        assert!(people().reals("sex").is_err());
    }

    #[test]
    fn take_and_filter() {
        let t = people();
        let subset = t.take(&[3, 3, 0]);
        assert_eq!(subset.len(), 3);
        assert_eq!(subset.codes("person_id").unwrap(), &[4, 4, 1]);
        assert_eq!(subset.reals("weight").unwrap(), &[4.0, 4.0, 1.0]);

        let women = t.filter(&[false, true, true, false]);
        assert_eq!(women.codes("person_id").unwrap(), &[2, 3]);
    }

    #[test]
    fn concat_requires_same_schema() {
        let both = Table::concat(vec![people(), people()]).unwrap();
        assert_eq!(both.len(), 8);
        assert_eq!(both.distinct("person_id").unwrap(), vec![1, 2, 3, 4]);

        let other = Table::new(1).with_codes("person_id", vec![9]).unwrap();
        assert!(Table::concat(vec![people(), other]).is_err());
        assert!(Table::concat(Vec::new()).unwrap().is_empty());
    }
}

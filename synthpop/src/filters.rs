//! Boolean row selections over categorical columns, built once per column and value so that
//! conjunctive filters over many value combinations are cheap elementwise ANDs rather than
//! repeated scans.

use anyhow::Result;

use crate::{Code, Table};

/// For an ordered list of categorical columns, the sorted distinct values each column takes
/// across several tables. Filters from different tables built over the same `Domains` line up
/// value for value.
#[derive(Clone, Debug, PartialEq)]
pub struct Domains {
    columns: Vec<String>,
    values: Vec<Vec<Code>>,
}

impl Domains {
    /// The union of every table's values, per column. Column order is kept as given; it's
    /// significant to callers that back off from the last column.
    pub fn union(columns: &[String], tables: &[&Table]) -> Result<Domains> {
        let mut values = Vec::new();
        for column in columns {
            let mut domain = Vec::new();
            for table in tables {
                domain.extend(table.codes(column)?.iter().cloned());
            }
            domain.sort_unstable();
            domain.dedup();
            values.push(domain);
        }
        Ok(Domains {
            columns: columns.to_vec(),
            values,
        })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self, column: usize) -> &[Code] {
        &self.values[column]
    }

    /// The index of a value in one column's domain.
    pub fn position(&self, column: usize, value: Code) -> Option<usize> {
        self.values[column].binary_search(&value).ok()
    }

    /// Each row of the table as a tuple of domain indices, one per column.
    pub fn encode(&self, table: &Table) -> Result<Vec<Vec<usize>>> {
        let mut rows = vec![Vec::with_capacity(self.columns.len()); table.len()];
        for (idx, column) in self.columns.iter().enumerate() {
            for (row, value) in rows.iter_mut().zip(table.codes(column)?) {
                match self.position(idx, *value) {
                    Some(pos) => row.push(pos),
                    None => bail!("{} = {} isn't part of the domain", column, value),
                }
            }
        }
        Ok(rows)
    }
}

/// Per-column, per-value row masks for one table.
pub struct FilterIndex {
    len: usize,
    // Indexed by column, then by position in that column's domain
    masks: Vec<Vec<Vec<bool>>>,
}

impl FilterIndex {
    pub fn build(table: &Table, domains: &Domains) -> Result<FilterIndex> {
        let mut masks = Vec::new();
        for (idx, column) in domains.columns().iter().enumerate() {
            let values = table.codes(column)?;
            let mut per_value = vec![vec![false; table.len()]; domains.values(idx).len()];
            for (row, value) in values.iter().enumerate() {
                // Every value of the table is in a union domain; a domain built without this table
                // just leaves the row unselected.
                if let Some(pos) = domains.position(idx, *value) {
                    per_value[pos][row] = true;
                }
            }
            masks.push(per_value);
        }
        Ok(FilterIndex {
            len: table.len(),
            masks,
        })
    }

    /// Rows matching a combination of domain indices for the first `combination.len()` columns.
    /// The empty combination selects every row.
    pub fn mask(&self, combination: &[usize]) -> Vec<bool> {
        assert!(combination.len() <= self.masks.len());
        let mut result = vec![true; self.len];
        for (column, value) in combination.iter().enumerate() {
            and_in_place(&mut result, &self.masks[column][*value]);
        }
        result
    }
}

fn and_in_place(mask: &mut [bool], other: &[bool]) {
    for (x, y) in mask.iter_mut().zip(other) {
        *x &= *y;
    }
}

/// Indices of the selected rows.
pub fn selected(mask: &[bool]) -> Vec<usize> {
    mask.iter()
        .enumerate()
        .filter_map(|(idx, x)| if *x { Some(idx) } else { None })
        .collect()
}

/// A row of a table as staged in object storage.
///
/// Values are in table column order and keep the textual form of the staged files; `None` is
/// SQL `NULL`. Typing happens in the warehouse when files are loaded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRow {
    values: Vec<Option<String>>,
}

impl TableRow {
    pub fn new(values: Vec<Option<String>>) -> Self {
        Self { values }
    }

    /// Returns the row values in table column order.
    pub fn values(&self) -> &[Option<String>] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut Vec<Option<String>> {
        &mut self.values
    }

    pub fn into_values(self) -> Vec<Option<String>> {
        self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<S: Into<String>> FromIterator<Option<S>> for TableRow {
    fn from_iter<I: IntoIterator<Item = Option<S>>>(iter: I) -> Self {
        TableRow::new(iter.into_iter().map(|v| v.map(Into::into)).collect())
    }
}

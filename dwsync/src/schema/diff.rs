use std::collections::HashMap;

use crate::types::TableColumn;

/// A single column-level change between two versions of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaChange {
    /// A column present only in the new version.
    AddColumn(TableColumn),
    /// A column present in both versions whose type or nullability changed.
    AlterColumn {
        previous: TableColumn,
        latest: TableColumn,
    },
    /// A column present only in the old version.
    DropColumn(TableColumn),
}

impl SchemaChange {
    /// Name of the affected column.
    pub fn column_name(&self) -> &str {
        match self {
            SchemaChange::AddColumn(column) | SchemaChange::DropColumn(column) => &column.name,
            SchemaChange::AlterColumn { latest, .. } => &latest.name,
        }
    }

    /// Applies this change to a column list. Added columns are appended.
    pub fn apply(&self, columns: &mut Vec<TableColumn>) {
        match self {
            SchemaChange::AddColumn(column) => columns.push(column.clone()),
            SchemaChange::AlterColumn { latest, .. } => {
                if let Some(existing) = columns.iter_mut().find(|c| c.name == latest.name) {
                    *existing = latest.clone();
                }
            }
            SchemaChange::DropColumn(column) => columns.retain(|c| c.name != column.name),
        }
    }
}

/// Computes the ordered changes turning `old` into `new`.
///
/// Columns are matched by name, so a rename shows up as a drop plus an add. Additions come
/// first, then alterations, then drops; within each group columns keep their ordinal order.
/// Identical column sets produce no changes.
pub fn diff(old: &[TableColumn], new: &[TableColumn]) -> Vec<SchemaChange> {
    let old_by_name: HashMap<&str, &TableColumn> =
        old.iter().map(|c| (c.name.as_str(), c)).collect();
    let new_by_name: HashMap<&str, &TableColumn> =
        new.iter().map(|c| (c.name.as_str(), c)).collect();

    let mut additions = Vec::new();
    let mut alterations = Vec::new();
    for latest in new {
        match old_by_name.get(latest.name.as_str()) {
            None => additions.push(SchemaChange::AddColumn(latest.clone())),
            Some(previous) if is_altered(previous, latest) => {
                alterations.push(SchemaChange::AlterColumn {
                    previous: (*previous).clone(),
                    latest: latest.clone(),
                })
            }
            Some(_) => {}
        }
    }

    let drops = old
        .iter()
        .filter(|c| !new_by_name.contains_key(c.name.as_str()))
        .map(|c| SchemaChange::DropColumn(c.clone()));

    additions
        .into_iter()
        .chain(alterations)
        .chain(drops)
        .collect()
}

/// Key membership is not compared: warehouse keys are informational and do not change with DDL
/// on existing columns.
fn is_altered(previous: &TableColumn, latest: &TableColumn) -> bool {
    previous.column_type != latest.column_type || previous.nullable != latest.nullable
}

#[cfg(test)]
mod tests {
    use rand::seq::SliceRandom;
    use rand::{Rng, thread_rng};

    use super::*;
    use crate::types::ColumnType;

    fn int(name: &str) -> TableColumn {
        TableColumn::new(name, ColumnType::Int { unsigned: false }, true)
    }

    fn text(name: &str) -> TableColumn {
        TableColumn::new(name, ColumnType::Text, true)
    }

    fn apply_all(old: &[TableColumn], changes: &[SchemaChange]) -> Vec<TableColumn> {
        let mut columns = old.to_vec();
        for change in changes {
            change.apply(&mut columns);
        }
        columns
    }

    fn sorted(mut columns: Vec<TableColumn>) -> Vec<TableColumn> {
        columns.sort_by(|a, b| a.name.cmp(&b.name));
        columns
    }

    #[test]
    fn identical_columns_produce_no_changes() {
        let columns = vec![int("id").primary(), text("note")];
        assert!(diff(&columns, &columns).is_empty());
    }

    #[test]
    fn changes_are_ordered_additions_alterations_drops() {
        let old = vec![int("id").primary(), text("dropped"), int("widened")];
        let new = vec![
            int("id").primary(),
            TableColumn::new("widened", ColumnType::BigInt { unsigned: false }, true),
            text("added_a"),
            text("added_b"),
        ];

        let changes = diff(&old, &new);
        let names: Vec<&str> = changes.iter().map(|c| c.column_name()).collect();

        assert_eq!(names, vec!["added_a", "added_b", "widened", "dropped"]);
        assert!(matches!(changes[0], SchemaChange::AddColumn(_)));
        assert!(matches!(changes[2], SchemaChange::AlterColumn { .. }));
        assert!(matches!(changes[3], SchemaChange::DropColumn(_)));
    }

    #[test]
    fn nullability_change_is_an_alteration() {
        let old = vec![int("id").primary(), text("note")];
        let new = vec![
            int("id").primary(),
            TableColumn::new("note", ColumnType::Text, false),
        ];

        let changes = diff(&old, &new);
        assert_eq!(changes.len(), 1);
        match &changes[0] {
            SchemaChange::AlterColumn { previous, latest } => {
                assert!(previous.nullable);
                assert!(!latest.nullable);
            }
            other => panic!("unexpected change: {other:?}"),
        }
    }

    #[test]
    fn rename_is_a_drop_and_an_add() {
        let old = vec![int("id").primary(), text("before")];
        let new = vec![int("id").primary(), text("after")];

        assert_eq!(
            diff(&old, &new),
            vec![
                SchemaChange::AddColumn(text("after")),
                SchemaChange::DropColumn(text("before")),
            ]
        );
    }

    #[test]
    fn applying_the_diff_yields_the_new_columns() {
        let old = vec![int("id").primary(), int("a"), text("b")];
        let new = vec![int("id").primary(), text("a"), text("c"), int("d")];

        let changes = diff(&old, &new);
        assert_eq!(sorted(apply_all(&old, &changes)), sorted(new));
    }

    #[test]
    fn applying_the_diff_yields_the_new_columns_for_random_schemas() {
        let mut rng = thread_rng();
        let types = [
            ColumnType::Int { unsigned: false },
            ColumnType::BigInt { unsigned: true },
            ColumnType::Text,
            ColumnType::Boolean,
            ColumnType::Decimal {
                precision: 12,
                scale: 2,
            },
        ];
        let names: Vec<String> = (0..12).map(|i| format!("c{i}")).collect();

        for _ in 0..200 {
            let mut random_columns = || {
                let mut chosen: Vec<&String> = names.iter().collect();
                chosen.shuffle(&mut rng);
                let count = rng.gen_range(0..=names.len());
                chosen
                    .into_iter()
                    .take(count)
                    .map(|name| {
                        let column_type = *types.choose(&mut rng).unwrap();
                        TableColumn::new(name.clone(), column_type, rng.gen_bool(0.5))
                    })
                    .collect::<Vec<_>>()
            };
            let old = random_columns();
            let new = random_columns();

            let changes = diff(&old, &new);
            assert_eq!(sorted(apply_all(&old, &changes)), sorted(new.clone()));
            assert!(diff(&new, &new).is_empty());
        }
    }

    #[test]
    fn pure_additions_preserve_column_order() {
        let old = vec![int("id").primary(), int("amount")];
        let new = vec![int("id").primary(), int("amount"), text("shipped")];

        assert_eq!(apply_all(&old, &diff(&old, &new)), new);
    }
}

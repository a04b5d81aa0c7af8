use std::fmt;

use crate::bail;
use crate::error::{ErrorKind, SyncResult};

/// Precision used for `DECIMAL` columns declared without one.
const DEFAULT_DECIMAL_PRECISION: u8 = 10;

/// Warehouse-neutral column type, parsed from source type names.
///
/// Each connector renders its own dialect type from this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    /// `TINYINT(1)` / `BOOL`.
    Boolean,
    TinyInt { unsigned: bool },
    SmallInt { unsigned: bool },
    MediumInt { unsigned: bool },
    Int { unsigned: bool },
    BigInt { unsigned: bool },
    Float,
    Double,
    Decimal { precision: u8, scale: u8 },
    Char { length: Option<u32> },
    Varchar { length: Option<u32> },
    Text,
    Binary { length: Option<u32> },
    Varbinary { length: Option<u32> },
    Blob,
    Date,
    Time,
    DateTime,
    Timestamp,
    Year,
    Json,
    Enum,
    Set,
    Bit { length: Option<u32> },
}

impl ColumnType {
    /// Parses a source type.
    ///
    /// `type_name` may be a bare name (`INT UNSIGNED`) or a full column type (`decimal(12,2)`).
    /// `precision` and `scale`, when given, override the arguments written in parentheses.
    pub fn parse(type_name: &str, precision: Option<u32>, scale: Option<u32>) -> SyncResult<Self> {
        let lowered = type_name.trim().to_ascii_lowercase();
        let unsigned = lowered.contains("unsigned");

        let (base, arguments) = match lowered.split_once('(') {
            Some((base, rest)) => {
                let inner = rest.split(')').next().unwrap_or_default();
                (base.trim(), parse_arguments(inner))
            }
            None => (
                lowered.split_whitespace().next().unwrap_or_default(),
                Vec::new(),
            ),
        };

        let first = precision.or_else(|| arguments.first().copied());
        let second = scale.or_else(|| arguments.get(1).copied());

        let column_type = match base {
            "bool" | "boolean" => ColumnType::Boolean,
            "tinyint" if first == Some(1) && !unsigned => ColumnType::Boolean,
            "tinyint" => ColumnType::TinyInt { unsigned },
            "smallint" => ColumnType::SmallInt { unsigned },
            "mediumint" => ColumnType::MediumInt { unsigned },
            "int" | "integer" => ColumnType::Int { unsigned },
            "bigint" => ColumnType::BigInt { unsigned },
            "float" => ColumnType::Float,
            "double" | "real" => ColumnType::Double,
            "decimal" | "numeric" => ColumnType::Decimal {
                precision: narrow(first.unwrap_or(DEFAULT_DECIMAL_PRECISION as u32), type_name)?,
                scale: narrow(second.unwrap_or(0), type_name)?,
            },
            "char" => ColumnType::Char { length: first },
            "varchar" => ColumnType::Varchar { length: first },
            "tinytext" | "text" | "mediumtext" | "longtext" => ColumnType::Text,
            "binary" => ColumnType::Binary { length: first },
            "varbinary" => ColumnType::Varbinary { length: first },
            "tinyblob" | "blob" | "mediumblob" | "longblob" => ColumnType::Blob,
            "date" => ColumnType::Date,
            "time" => ColumnType::Time,
            "datetime" => ColumnType::DateTime,
            "timestamp" => ColumnType::Timestamp,
            "year" => ColumnType::Year,
            "json" => ColumnType::Json,
            "enum" => ColumnType::Enum,
            "set" => ColumnType::Set,
            "bit" => ColumnType::Bit { length: first },
            _ => bail!(
                ErrorKind::SchemaError,
                "Unsupported source column type",
                type_name
            ),
        };

        Ok(column_type)
    }

    /// Returns `true` for integral types.
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            ColumnType::TinyInt { .. }
                | ColumnType::SmallInt { .. }
                | ColumnType::MediumInt { .. }
                | ColumnType::Int { .. }
                | ColumnType::BigInt { .. }
        )
    }
}

impl fmt::Display for ColumnType {
    /// Renders the MySQL spelling of the type.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ColumnType::Boolean => f.write_str("BOOLEAN"),
            ColumnType::TinyInt { unsigned } => write_signed(f, "TINYINT", unsigned),
            ColumnType::SmallInt { unsigned } => write_signed(f, "SMALLINT", unsigned),
            ColumnType::MediumInt { unsigned } => write_signed(f, "MEDIUMINT", unsigned),
            ColumnType::Int { unsigned } => write_signed(f, "INT", unsigned),
            ColumnType::BigInt { unsigned } => write_signed(f, "BIGINT", unsigned),
            ColumnType::Float => f.write_str("FLOAT"),
            ColumnType::Double => f.write_str("DOUBLE"),
            ColumnType::Decimal { precision, scale } => write!(f, "DECIMAL({precision},{scale})"),
            ColumnType::Char { length } => write_sized(f, "CHAR", length),
            ColumnType::Varchar { length } => write_sized(f, "VARCHAR", length),
            ColumnType::Text => f.write_str("TEXT"),
            ColumnType::Binary { length } => write_sized(f, "BINARY", length),
            ColumnType::Varbinary { length } => write_sized(f, "VARBINARY", length),
            ColumnType::Blob => f.write_str("BLOB"),
            ColumnType::Date => f.write_str("DATE"),
            ColumnType::Time => f.write_str("TIME"),
            ColumnType::DateTime => f.write_str("DATETIME"),
            ColumnType::Timestamp => f.write_str("TIMESTAMP"),
            ColumnType::Year => f.write_str("YEAR"),
            ColumnType::Json => f.write_str("JSON"),
            ColumnType::Enum => f.write_str("ENUM"),
            ColumnType::Set => f.write_str("SET"),
            ColumnType::Bit { length } => write_sized(f, "BIT", length),
        }
    }
}

fn write_signed(f: &mut fmt::Formatter<'_>, name: &str, unsigned: bool) -> fmt::Result {
    if unsigned {
        write!(f, "{name} UNSIGNED")
    } else {
        f.write_str(name)
    }
}

fn write_sized(f: &mut fmt::Formatter<'_>, name: &str, length: Option<u32>) -> fmt::Result {
    match length {
        Some(length) => write!(f, "{name}({length})"),
        None => f.write_str(name),
    }
}

fn parse_arguments(inner: &str) -> Vec<u32> {
    inner
        .split(',')
        .filter_map(|argument| argument.trim().parse().ok())
        .collect()
}

fn narrow(value: u32, type_name: &str) -> SyncResult<u8> {
    match u8::try_from(value) {
        Ok(value) => Ok(value),
        Err(_) => bail!(
            ErrorKind::SchemaError,
            "Column precision out of range",
            format!("{type_name} declares precision {value}")
        ),
    }
}

/// A column of a replicated table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableColumn {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub primary_key: bool,
}

impl TableColumn {
    pub fn new(name: impl Into<String>, column_type: ColumnType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable,
            primary_key: false,
        }
    }

    /// Marks the column as part of the primary key. Key columns are never nullable.
    pub fn primary(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_information_schema_column_types() {
        assert_eq!(
            ColumnType::parse("int(11) unsigned", None, None).unwrap(),
            ColumnType::Int { unsigned: true }
        );
        assert_eq!(
            ColumnType::parse("decimal(12,2)", None, None).unwrap(),
            ColumnType::Decimal {
                precision: 12,
                scale: 2
            }
        );
        assert_eq!(
            ColumnType::parse("varchar(255)", None, None).unwrap(),
            ColumnType::Varchar { length: Some(255) }
        );
        assert_eq!(
            ColumnType::parse("tinyint(1)", None, None).unwrap(),
            ColumnType::Boolean
        );
    }

    #[test]
    fn parses_changefeed_schema_types_with_explicit_precision() {
        assert_eq!(
            ColumnType::parse("DECIMAL", Some(20), Some(4)).unwrap(),
            ColumnType::Decimal {
                precision: 20,
                scale: 4
            }
        );
        assert_eq!(
            ColumnType::parse("BIGINT UNSIGNED", Some(20), None).unwrap(),
            ColumnType::BigInt { unsigned: true }
        );
        assert_eq!(
            ColumnType::parse("TINYINT", Some(1), None).unwrap(),
            ColumnType::Boolean
        );
        assert_eq!(
            ColumnType::parse("TINYINT", Some(4), None).unwrap(),
            ColumnType::TinyInt { unsigned: false }
        );
    }

    #[test]
    fn decimal_without_arguments_uses_default_precision() {
        assert_eq!(
            ColumnType::parse("decimal", None, None).unwrap(),
            ColumnType::Decimal {
                precision: 10,
                scale: 0
            }
        );
    }

    #[test]
    fn unknown_type_is_a_schema_error() {
        let err = ColumnType::parse("geometry", None, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaError);
    }

    #[test]
    fn primary_columns_are_not_nullable() {
        let column = TableColumn::new("id", ColumnType::Int { unsigned: false }, true).primary();
        assert!(column.primary_key);
        assert!(!column.nullable);
    }
}

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;

use sqlx::error::BoxDynError;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Arguments, Decode, Encode, Row, Sqlite, Type, ValueRef};

use super::{DatabaseError, Transaction};

type Binder = Box<dyn for<'q> FnOnce(&mut SqliteArguments<'q>) -> Result<(), BoxDynError> + Send>;

/// A statement with `:named` parameters.
///
/// Each distinct name becomes one numbered SQLite parameter, so a name
/// used several times in the text is bound once. Names inside string
/// literals are left untouched.
pub struct Query {
    sql: String,
    names: Vec<String>,
    bindings: HashMap<String, Binder>,
}

impl Query {
    pub fn new(sql: impl AsRef<str>) -> Self {
        let (sql, names) = rewrite(sql.as_ref());
        Self {
            sql,
            names,
            bindings: HashMap::new(),
        }
    }

    /// Bind `value` to the parameter `name` (without the leading colon).
    pub fn param<T>(mut self, name: &str, value: T) -> Self
    where
        T: for<'q> Encode<'q, Sqlite> + Type<Sqlite> + Send + 'static,
    {
        self.bind(name, value);
        self
    }

    /// Bind in place, replacing any earlier value for `name`.
    pub fn bind<T>(&mut self, name: &str, value: T) -> &mut Self
    where
        T: for<'q> Encode<'q, Sqlite> + Type<Sqlite> + Send + 'static,
    {
        let binder: Binder = Box::new(move |arguments: &mut SqliteArguments<'_>| arguments.add(value));
        self.bindings.insert(name.trim_start_matches(':').to_string(), binder);
        self
    }

    /// Run the statement and return how many rows it changed.
    pub async fn execute(self, tx: &mut Transaction<'_>) -> Result<u64, DatabaseError> {
        let Self { sql, names, bindings } = self;
        let arguments = arguments(&names, bindings)?;

        let result = sqlx::query_with(&sql, arguments)
            .execute(tx.connection())
            .await?;

        Ok(result.rows_affected())
    }

    /// Run the statement and collect every row it produced.
    pub async fn fetch(self, tx: &mut Transaction<'_>) -> Result<Rows, DatabaseError> {
        let Self { sql, names, bindings } = self;
        let arguments = arguments(&names, bindings)?;

        let rows = sqlx::query_with(&sql, arguments)
            .fetch_all(tx.connection())
            .await?;

        Ok(Rows(rows.into_iter().map(|row| Record { row }).collect()))
    }

    /// Run the statement and return its first row, if any.
    pub async fn fetch_optional(self, tx: &mut Transaction<'_>) -> Result<Option<Record>, DatabaseError> {
        Ok(self.fetch(tx).await?.0.into_iter().next())
    }

    /* Getters */

    /// The statement as handed to SQLite.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Parameter names in the order SQLite numbers them.
    pub fn parameters(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("sql", &self.sql)
            .field("names", &self.names)
            .field("bound", &self.bindings.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn arguments(
    names: &[String],
    mut bindings: HashMap<String, Binder>,
) -> Result<SqliteArguments<'static>, DatabaseError> {
    let mut arguments = SqliteArguments::default();

    for name in names {
        let binder = bindings
            .remove(name)
            .ok_or_else(|| DatabaseError::UnboundParameter(name.clone()))?;

        binder(&mut arguments).map_err(|e| DatabaseError::Bind {
            name: name.clone(),
            message: e.to_string(),
        })?;
    }

    if let Some(name) = bindings.keys().next() {
        return Err(DatabaseError::Bind {
            name: name.clone(),
            message: "no such parameter in statement".to_string(),
        });
    }

    Ok(arguments)
}

/// Replace `:name` parameters with `?N`, returning the new text and the
/// distinct names in numbering order.
fn rewrite(sql: &str) -> (String, Vec<String>) {
    let mut output = String::with_capacity(sql.len());
    let mut names: Vec<String> = Vec::new();
    let mut quote: Option<char> = None;
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        if let Some(open) = quote {
            output.push(c);
            if c == open {
                quote = None;
            }
            continue;
        }

        match c {
            '\'' | '"' => {
                quote = Some(c);
                output.push(c);
            }
            ':' if chars
                .peek()
                .is_some_and(|next| next.is_ascii_alphabetic() || *next == '_') =>
            {
                let mut name = String::new();
                while let Some(next) = chars.peek().copied() {
                    if next.is_ascii_alphanumeric() || next == '_' {
                        name.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }

                let index = match names.iter().position(|existing| *existing == name) {
                    Some(index) => index,
                    None => {
                        names.push(name);
                        names.len() - 1
                    }
                };

                output.push('?');
                output.push_str(&(index + 1).to_string());
            }
            _ => output.push(c),
        }
    }

    (output, names)
}

/// Rows produced by [`Query::fetch`].
#[derive(Debug, Default)]
pub struct Rows(Vec<Record>);

impl Deref for Rows {
    type Target = [Record];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl IntoIterator for Rows {
    type Item = Record;
    type IntoIter = std::vec::IntoIter<Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// One result row with typed field access.
pub struct Record {
    row: SqliteRow,
}

impl Record {
    /// Decode the field `name` as `T`.
    pub fn get<T>(&self, name: &str) -> Result<T, DatabaseError>
    where
        T: for<'r> Decode<'r, Sqlite> + Type<Sqlite>,
    {
        self.row
            .try_get::<T, _>(name)
            .map_err(|source| DatabaseError::Field {
                name: name.to_string(),
                source,
            })
    }

    pub fn is_null(&self, name: &str) -> Result<bool, DatabaseError> {
        self.row
            .try_get_raw(name)
            .map(|value| value.is_null())
            .map_err(|source| DatabaseError::Field {
                name: name.to_string(),
                source,
            })
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("columns", &self.row.len())
            .finish()
    }
}

//! Typed extraction of the routing headers.
//!
//! `x-conn-name` selects the connection and is always required;
//! `x-database` selects the database and is required everywhere except
//! `/db/databases`, which falls back to the connection's default database.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::error::Error;

/// The (connection, database) a request is routed to.
pub struct Routing {
    pub connection: String,
    pub database: Option<String>,
}

impl Routing {
    /// The database header, required.
    pub fn database(&self) -> Result<&str, Error> {
        self.database
            .as_deref()
            .ok_or_else(|| Error::missing_field("x-database"))
    }
}

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Routing {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let connection = header_value(parts, "x-conn-name")?
            .ok_or_else(|| Error::missing_field("x-conn-name"))?;
        let database = header_value(parts, "x-database")?;
        Ok(Self {
            connection,
            database,
        })
    }
}

fn header_value(parts: &Parts, name: &str) -> Result<Option<String>, Error> {
    match parts.headers.get(name) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .map(|s| Some(s.to_owned()))
            .map_err(|_| Error::bad_request(format!("`{name}` header is not valid UTF-8"))),
    }
}

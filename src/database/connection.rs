use log::{error, warn};
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use postgres_openssl::MakeTlsConnector;
use std::future::Future;
use tokio::time::Duration;
use tokio_postgres::{Client, NoTls};
use url::Url;

use crate::error::StorageError;

const MAX_RETRIES: usize = 5;
const WAIT_BETWEEN_RETRIES: u64 = 5;

pub fn create_ssl_connector(sslrootcert_path: &str) -> Result<MakeTlsConnector, StorageError> {
    let mut builder = SslConnector::builder(SslMethod::tls())
        .map_err(|e| StorageError::Tls(format!("SSL builder error: {}", e)))?;

    builder
        .set_ca_file(sslrootcert_path)
        .map_err(|e| StorageError::Tls(format!("Error loading CA cert: {}", e)))?;

    builder.set_verify(SslVerifyMode::PEER);

    Ok(MakeTlsConnector::new(builder.build()))
}

/// Strip `sslrootcert` from the query string, since libpq-style parameters
/// the driver does not understand make it reject the URL.
///
/// # Returns
/// The cleaned URL and the CA certificate path, if one was given
pub fn split_ssl_params(database_url: &str) -> Result<(String, Option<String>), StorageError> {
    let url = Url::parse(database_url).map_err(|e| StorageError::Config(e.to_string()))?;

    let mut sslrootcert_path = None;
    let mut clean_params = Vec::new();
    for (key, value) in url.query_pairs() {
        if key == "sslrootcert" {
            sslrootcert_path = Some(value.to_string());
        } else {
            clean_params.push((key.into_owned(), value.into_owned()));
        }
    }

    let mut clean_url = url.clone();
    clean_url.set_query(None);
    if !clean_params.is_empty() {
        let query = clean_params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        clean_url.set_query(Some(&query));
    }

    Ok((clean_url.to_string(), sslrootcert_path))
}

/// Open a client, over TLS when the URL names a CA certificate.
pub async fn connect(database_url: &str) -> Result<Client, StorageError> {
    let (clean_database_url, sslrootcert_path) = split_ssl_params(database_url)?;

    let client = match sslrootcert_path {
        Some(path) => {
            let connector = create_ssl_connector(&path)?;
            let (client, connection) = tokio_postgres::connect(&clean_database_url, connector).await?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    error!("Connection error: {}", e);
                }
            });
            client
        }
        None => {
            let (client, connection) = tokio_postgres::connect(&clean_database_url, NoTls).await?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    error!("Connection error: {}", e);
                }
            });
            client
        }
    };

    Ok(client)
}

/// Run `operation` on a fresh connection, retrying connection and query
/// failures a bounded number of times.
///
/// Configuration errors (bad URL, unreadable certificate) are returned
/// immediately; retrying cannot fix them.
pub async fn execute_with_retry<F, Fut, T>(database_url: &str, operation: F) -> Result<T, StorageError>
where
    F: Fn(Client) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, tokio_postgres::Error>> + Send,
{
    for attempt in 0..MAX_RETRIES {
        match connect(database_url).await {
            Ok(client) => match operation(client).await {
                Ok(result) => return Ok(result),
                Err(e) => error!("Attempt {}: query error: {}", attempt + 1, e),
            },
            Err(StorageError::Query(e)) => error!("Attempt {}: connection error: {}", attempt + 1, e),
            Err(e) => return Err(e),
        }

        if attempt < MAX_RETRIES - 1 {
            warn!("Retrying database operation in {} seconds", WAIT_BETWEEN_RETRIES);
            tokio::time::sleep(Duration::from_secs(WAIT_BETWEEN_RETRIES)).await;
        }
    }

    Err(StorageError::RetriesExhausted(MAX_RETRIES))
}

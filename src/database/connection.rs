use log::{error, info};
use openssl::error::ErrorStack;
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use postgres_openssl::MakeTlsConnector;
use tokio_postgres::{Client, NoTls};
use url::Url;

use crate::database::sink::SinkConnectError;

pub fn create_ssl_connector(sslrootcert_path: &str) -> Result<MakeTlsConnector, ErrorStack> {
    let mut builder = SslConnector::builder(SslMethod::tls())?;
    builder.set_ca_file(sslrootcert_path)?;
    builder.set_verify(SslVerifyMode::PEER);
    Ok(MakeTlsConnector::new(builder.build()))
}

/// Database URL split into what tokio-postgres understands and the CA file
/// used for TLS.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSettings {
    pub url: String,
    pub sslrootcert: Option<String>,
}

impl ConnectionSettings {
    /// Parse a `postgres://` URL, pulling out the `sslrootcert` query parameter.
    /// Without it the connection is made in plain text.
    pub fn parse(database_url: &str) -> Result<Self, SinkConnectError> {
        let url = Url::parse(database_url)?;

        let mut sslrootcert = None;
        let mut clean_params = Vec::new();
        for (key, value) in url.query_pairs() {
            if key == "sslrootcert" {
                sslrootcert = Some(value.to_string());
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

        Ok(ConnectionSettings {
            url: clean_url.to_string(),
            sslrootcert,
        })
    }

    /// Open a connection and drive it on a background task
    pub async fn connect(&self) -> Result<Client, SinkConnectError> {
        let client = match &self.sslrootcert {
            Some(path) => {
                let connector = create_ssl_connector(path)?;
                let (client, connection) = tokio_postgres::connect(&self.url, connector).await?;
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        error!("Connection error: {}", e);
                    }
                });
                client
            }
            None => {
                let (client, connection) = tokio_postgres::connect(&self.url, NoTls).await?;
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        error!("Connection error: {}", e);
                    }
                });
                client
            }
        };
        info!(
            "Connected to database ({})",
            if self.sslrootcert.is_some() { "TLS" } else { "plain" }
        );
        Ok(client)
    }
}

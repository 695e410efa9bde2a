use std::time::Duration;

use url::Url;

use crate::config::Config;
use crate::error::ClientError;

/// Authentication material forwarded to the server as connect-URL query
/// parameters. The client never inspects the token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthParams {
    pub provider: String,
    pub token: String,
}

/// Connection endpoint settings, extracted from the app [`Config`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub connect_timeout: Duration,
}

impl TransportConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            tls: config.tls,
            connect_timeout: config.connect_timeout,
        }
    }

    /// Builds the connect URL for one session attempt.
    pub fn session_url(
        &self,
        session_id: &str,
        auth: Option<&AuthParams>,
    ) -> Result<Url, ClientError> {
        let scheme = if self.tls { "wss" } else { "ws" };
        let base = format!("{scheme}://{}:{}/connect", self.host, self.port);
        let mut url = Url::parse(&base)
            .map_err(|err| ClientError::InvalidRequest(format!("invalid endpoint: {err}")))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("sessionId", session_id);
            if let Some(auth) = auth {
                query.append_pair("authProvider", &auth.provider);
                query.append_pair("token", &auth.token);
            }
        }
        Ok(url)
    }
}

use tracing::debug;
use tracing::error;

use super::client::NutClient;
use super::client::NutError;
use super::status::Status;

/// Data retrieved from one NUT server
///
/// Acts as the single point responsible for fetching updates for an entry;
/// every entity of the entry reads from the snapshot held here.
pub struct NutData<C: NutClient> {
    host: String,
    alias: Option<String>,
    client: C,
    ups_list: Option<Vec<(String, String)>>,
    status: Option<Status>,
}

impl<C: NutClient> NutData<C> {
    pub fn new(host: impl Into<String>, alias: Option<String>, client: C) -> Self {
        Self {
            host: host.into(),
            alias,
            client,
            ups_list: None,
            status: None,
        }
    }

    /// Latest status, `None` until a fetch succeeds or after one fails
    pub fn status(&self) -> Option<&Status> {
        self.status.as_ref()
    }

    /// Configured or resolved UPS alias
    pub fn name(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    /// UPS list seen when the alias was resolved from the server
    pub fn ups_list(&self) -> Option<&[(String, String)]> {
        self.ups_list.as_deref()
    }

    /// Fetch the latest status from NUT
    ///
    /// Blocks on network IO. A failed fetch clears the snapshot rather than
    /// keeping stale values around.
    pub fn update(&mut self) -> Option<&Status> {
        self.status = match self.fetch_status() {
            Ok(status) => Some(status),
            Err(FetchError::NoAlias) => None,
            Err(FetchError::Nut(e)) => {
                debug!("Error getting NUT vars for host {}: {}", self.host, e);
                None
            }
        };
        self.status.as_ref()
    }

    fn fetch_status(&mut self) -> Result<Status, FetchError> {
        if self.alias.is_none() {
            self.alias = self.resolve_alias();
        }
        let alias = self.alias.as_deref().ok_or(FetchError::NoAlias)?;
        Ok(self.client.list_vars(alias)?)
    }

    fn resolve_alias(&mut self) -> Option<String> {
        let ups_list = match self.client.list_ups() {
            Ok(list) => list,
            Err(e) => {
                error!("Failure getting NUT ups alias, {}", e);
                return None;
            }
        };

        let first = match ups_list.first() {
            Some((name, _)) => name.clone(),
            None => {
                error!("Empty list while getting NUT ups aliases");
                return None;
            }
        };

        debug!("Resolved NUT ups alias for host {}: {}", self.host, first);
        self.ups_list = Some(ups_list);
        Some(first)
    }
}

enum FetchError {
    /// No alias configured and none could be resolved
    NoAlias,
    Nut(NutError),
}

impl From<NutError> for FetchError {
    fn from(e: NutError) -> Self {
        FetchError::Nut(e)
    }
}

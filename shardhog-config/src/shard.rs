use serde::{Deserialize, Serialize};

/// Connection info for one shard database.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Shard {
    /// Host name or IP address.
    #[serde(default = "Shard::host")]
    pub host: String,

    /// TCP port.
    ///
    /// _Default:_ `5432`
    #[serde(default = "Shard::port")]
    pub port: u16,

    /// Database name.
    #[serde(default)]
    pub database_name: String,

    /// User to connect as.
    #[serde(default)]
    pub user: String,

    /// Password, if the backend requires one.
    #[serde(default)]
    pub password: String,
}

impl Shard {
    fn host() -> String {
        "127.0.0.1".into()
    }

    fn port() -> u16 {
        5432
    }
}

impl Default for Shard {
    fn default() -> Self {
        Self {
            host: Self::host(),
            port: Self::port(),
            database_name: String::new(),
            user: String::new(),
            password: String::new(),
        }
    }
}

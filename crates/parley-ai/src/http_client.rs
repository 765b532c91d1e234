use reqwest::Client;

use crate::error::Result;

const DISABLE_SYSTEM_PROXY_ENV: &str = "PARLEY_DISABLE_SYSTEM_PROXY";

pub(crate) fn build_http_client() -> Result<Client> {
    let client = if should_disable_system_proxy() {
        Client::builder().no_proxy().build()?
    } else {
        Client::new()
    };
    Ok(client)
}

fn should_disable_system_proxy() -> bool {
    if std::env::var_os(DISABLE_SYSTEM_PROXY_ENV).is_some() {
        return true;
    }

    cfg!(test)
}

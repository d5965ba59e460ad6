use std::net::IpAddr;
use std::time::Duration;

use reqwest::ClientBuilder;

fn has_proxy_env() -> bool {
    [
        "HTTPS_PROXY",
        "https_proxy",
        "HTTP_PROXY",
        "http_proxy",
        "ALL_PROXY",
        "all_proxy",
    ]
    .iter()
    .any(|k| std::env::var(k).is_ok_and(|v| !v.trim().is_empty()))
}

// 本地模型运行时（ollama 等）监听在回环地址上，走代理只会失败
fn should_bypass_proxy_impl(url: &str, proxy_env_present: bool) -> bool {
    if !proxy_env_present {
        return false;
    }

    if std::env::var("GATEWAY_PROXY_LOCAL_RUNNERS")
        .is_ok_and(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "yes" | "YES"))
    {
        return false;
    }

    let Ok(u) = reqwest::Url::parse(url) else {
        return false;
    };
    let Some(host) = u.host_str() else {
        return false;
    };

    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .is_ok_and(|ip| ip.is_loopback())
}

pub fn should_bypass_proxy_for_url(url: &str) -> bool {
    should_bypass_proxy_impl(url, has_proxy_env())
}

pub fn maybe_disable_proxy(builder: ClientBuilder, url: &str) -> ClientBuilder {
    if should_bypass_proxy_for_url(url) {
        builder.no_proxy()
    } else {
        builder
    }
}

/// Shared client for one provider endpoint. Per-attempt deadlines are set on
/// each request; only the connect phase is bounded here.
pub fn client_for_url(url: &str) -> Result<reqwest::Client, reqwest::Error> {
    let builder = reqwest::Client::builder().connect_timeout(Duration::from_secs(10));
    maybe_disable_proxy(builder, url).build()
}

#[cfg(test)]
mod tests {
    use super::should_bypass_proxy_impl;

    #[test]
    fn bypass_proxy_for_loopback_runners_when_proxy_env_present() {
        assert!(should_bypass_proxy_impl("http://localhost:11434/api/chat", true));
        assert!(should_bypass_proxy_impl("http://127.0.0.1:11434", true));
        assert!(should_bypass_proxy_impl("http://[::1]:8080/v1", true));
        assert!(!should_bypass_proxy_impl("https://api.openai.com/v1", true));
    }

    #[test]
    fn do_not_bypass_without_proxy_env() {
        assert!(!should_bypass_proxy_impl("http://localhost:11434", false));
    }
}

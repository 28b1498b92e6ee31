use std::time::Duration;

/// How long we wait for upstream response headers before giving up on the
/// call. Separate from the total deadline so a stalled connect fails fast
/// while long streams keep flowing.
pub const RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(30);

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const TOTAL_DEADLINE: Duration = Duration::from_secs(10 * 60);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 100;

/// Shared upstream HTTP client. Redirects are never followed: a redirect
/// response would otherwise carry the injected credential to whatever host
/// the upstream names, so 3xx is relayed to the caller untouched.
pub fn build() -> reqwest::Client {
	reqwest::Client::builder()
		.redirect(reqwest::redirect::Policy::none())
		.connect_timeout(DIAL_TIMEOUT)
		.timeout(TOTAL_DEADLINE)
		.pool_idle_timeout(POOL_IDLE_TIMEOUT)
		.pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
		.use_rustls_tls()
		.build()
		.expect("upstream client construction cannot fail with static options")
}

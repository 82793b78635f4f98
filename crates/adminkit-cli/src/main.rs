//! adminkit - terminal client for the admin console backend.
//!
//! A thin front end over adminkit-core: signs in (the captcha image is
//! written to a temp file for an external viewer), lists users, shows
//! session status, and signs out. Table rendering, forms, and navigation
//! belong to the web console; this binary only drives the session layer.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::Engine;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use adminkit_core::auth::TokenStore;
use adminkit_core::models::{LoginRequest, RegisterRequest, SortOrder, UserQuery};
use adminkit_core::{ApiClient, ApiError, Config};

// ============================================================================
// Constants
// ============================================================================

/// Sign-in attempts before giving up. Each attempt consumes a fresh
/// captcha challenge.
const MAX_LOGIN_ATTEMPTS: usize = 3;

/// Page size for the users listing
const USER_PAGE_SIZE: u64 = 20;

/// Initialize the tracing subscriber for logging.
/// Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug).
fn init_tracing(log_dir: &Path) -> tracing_appender::non_blocking::WorkerGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let file_appender = tracing_appender::rolling::daily(log_dir, "adminkit.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let config = Config::load()?;
    let cache_dir = config.cache_dir()?;
    std::fs::create_dir_all(&cache_dir)?;

    let _guard = init_tracing(&cache_dir);
    info!("adminkit starting");

    let api = ApiClient::connect(&config, TokenStore::new(cache_dir))?;
    api.session().initialize().await?;

    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("status");

    match command {
        "login" => cmd_login(&api, config).await,
        "register" => cmd_register(&api).await,
        "users" => cmd_users(&api, args.get(2)).await,
        "status" => cmd_status(&api).await,
        "logout" => cmd_logout(&api).await,
        other => {
            eprintln!("unknown command: {}", other);
            print_usage();
            Ok(())
        }
    }
}

fn print_usage() {
    eprintln!("usage: adminkit [login|register|users [page]|status|logout]");
}

// ============================================================================
// Commands
// ============================================================================

async fn cmd_login(api: &ApiClient, mut config: Config) -> Result<()> {
    let username = prompt_default("Username", config.last_username.as_deref())?;
    let password = rpassword::prompt_password("Password: ")?;

    for _attempt in 1..=MAX_LOGIN_ATTEMPTS {
        let answer = solve_captcha(api).await?;

        let request = LoginRequest {
            username: username.clone(),
            password: password.clone(),
            captcha: Some(answer.text),
            captcha_id: Some(answer.challenge_id),
        };

        match api.login(&request).await {
            Ok(user) => {
                println!("Signed in as {} ({})", user.nickname, user.username);
                config.last_username = Some(username);
                config.save()?;
                return Ok(());
            }
            // The challenge is spent either way; the next attempt fetches
            // a fresh one.
            Err(ApiError::Rejected { message, .. }) => {
                eprintln!("Sign-in rejected: {}", message);
            }
            Err(err) => return Err(err.into()),
        }
    }

    anyhow::bail!("sign-in failed after {} attempts", MAX_LOGIN_ATTEMPTS)
}

async fn cmd_register(api: &ApiClient) -> Result<()> {
    let username = prompt("Username")?;
    let nickname = prompt("Nickname")?;
    let email = prompt("Email")?;
    let phone = prompt("Phone")?;
    let password = rpassword::prompt_password("Password: ")?;
    let confirm = rpassword::prompt_password("Confirm password: ")?;
    if password != confirm {
        anyhow::bail!("passwords do not match");
    }

    let answer = solve_captcha(api).await?;
    let request = RegisterRequest {
        username,
        password,
        confirm_password: confirm,
        nickname,
        phone,
        email,
        captcha: answer.text,
        captcha_id: answer.challenge_id,
    };

    match api.register(&request).await {
        Ok(()) => {
            println!("Account created. Sign in with `adminkit login`.");
            Ok(())
        }
        Err(ApiError::Rejected { message, .. }) => {
            eprintln!("Registration rejected: {}", message);
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

async fn cmd_users(api: &ApiClient, page: Option<&String>) -> Result<()> {
    let current = page
        .map(|value| value.parse::<u64>())
        .transpose()
        .context("page must be a number")?;

    let query = UserQuery {
        current,
        size: Some(USER_PAGE_SIZE),
        sort_by: Some("createTime".to_string()),
        sort_order: Some(SortOrder::Desc),
        filter: None,
    };

    match api.fetch_users(&query).await {
        Ok(page) => {
            let pages = page.total.div_ceil(page.size.max(1));
            println!("{} users (page {}/{})", page.total, page.current, pages);
            for user in &page.records {
                let status = if user.is_active() { "active" } else { "disabled" };
                println!(
                    "{:>6}  {:<20} {:<20} {}",
                    user.id, user.username, user.nickname, status
                );
            }
            Ok(())
        }
        Err(ApiError::SessionExpired) => {
            // One message for the whole batch; details are in the log.
            eprintln!("Session expired. Run `adminkit login` to sign in again.");
            Ok(())
        }
        Err(err) if err.is_transport() => {
            eprintln!("Could not reach the server: {}", err);
            eprintln!("Check the connection and try again.");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

async fn cmd_status(api: &ApiClient) -> Result<()> {
    match api.session().current_pair().await {
        Some(pair) => {
            if pair.is_expired() {
                println!("Signed in; access token expired (renews on next request)");
            } else if let Some(minutes) = pair.minutes_until_expiry() {
                println!("Signed in; access token valid for about {}m", minutes);
            } else {
                println!("Signed in");
            }
        }
        None => println!("Not signed in"),
    }
    Ok(())
}

async fn cmd_logout(api: &ApiClient) -> Result<()> {
    api.logout().await;
    println!("Signed out.");
    Ok(())
}

// ============================================================================
// Captcha and prompt helpers
// ============================================================================

struct CaptchaAnswer {
    challenge_id: String,
    text: String,
}

/// Fetch a challenge, hand the image to the user, and collect the answer.
async fn solve_captcha(api: &ApiClient) -> Result<CaptchaAnswer> {
    let challenge = api.fetch_captcha().await?;
    let image_path = write_captcha_image(&challenge.image_data)?;
    println!("Captcha image written to {}", image_path.display());
    let text = prompt("Captcha answer")?;
    Ok(CaptchaAnswer {
        challenge_id: challenge.id,
        text,
    })
}

fn write_captcha_image(image_data: &str) -> Result<PathBuf> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(image_data)
        .context("captcha image is not valid base64")?;
    let path = std::env::temp_dir().join("adminkit-captcha.png");
    std::fs::write(&path, bytes)?;
    Ok(path)
}

fn prompt(label: &str) -> Result<String> {
    print!("{}: ", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn prompt_default(label: &str, default: Option<&str>) -> Result<String> {
    let value = match default {
        Some(default) => prompt(&format!("{} [{}]", label, default))?,
        None => prompt(label)?,
    };
    if value.is_empty() {
        if let Some(default) = default {
            return Ok(default.to_string());
        }
    }
    Ok(value)
}

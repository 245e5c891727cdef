//! WhatsApp deep links for reaching out to a business.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{info, warn};

pub const WHATSAPP_BASE: &str = "https://wa.me/";

/// Shorter numbers are missing a country or area code.
pub const MIN_PHONE_DIGITS: usize = 10;

pub const DEFAULT_MESSAGE: &str = "Hi! How are you? \
I'm reaching out because we are launching an app that automates appointment booking \
and takes the weight of a hand-written schedule off your shoulders.

We just opened 10 spots to try it free for a month with full access.

I thought I'd write to you here in case you want to take the chance and get your \
business organized without it costing you anything.

Would something like this help your business, or do you already have a system that does the job?";

static NON_DIGIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^0-9]").expect("valid regex"));

/// Digits of `phone` with all formatting removed.
pub fn clean_number(phone: &str) -> String {
    NON_DIGIT.replace_all(phone, "").into_owned()
}

/// Link with the default promotional message, or `None` for unusable numbers.
pub fn contact_link(phone: &str) -> Option<String> {
    contact_link_with(phone, DEFAULT_MESSAGE)
}

/// Link with `message`, or the default message when none is configured.
pub fn contact_link_or_default(phone: &str, message: Option<&str>) -> Option<String> {
    contact_link_with(phone, message.unwrap_or(DEFAULT_MESSAGE))
}

pub fn contact_link_with(phone: &str, message: &str) -> Option<String> {
    let digits = clean_number(phone);
    if digits.len() < MIN_PHONE_DIGITS {
        return None;
    }
    Some(format!(
        "{}{}?text={}",
        WHATSAPP_BASE,
        digits,
        urlencoding::encode(message)
    ))
}

fn opener_command(link: &str) -> tokio::process::Command {
    if cfg!(target_os = "macos") {
        let mut cmd = tokio::process::Command::new("open");
        cmd.arg(link);
        cmd
    } else if cfg!(target_os = "windows") {
        let mut cmd = tokio::process::Command::new("cmd");
        // The empty argument is the window title expected by `start`.
        cmd.args(["/C", "start", "", link]);
        cmd
    } else {
        let mut cmd = tokio::process::Command::new("xdg-open");
        cmd.arg(link);
        cmd
    }
}

/// Open the link with the platform's default handler. `None` is a no-op.
pub async fn open_link(link: Option<&str>) -> std::io::Result<()> {
    let Some(link) = link else {
        return Ok(());
    };
    let status = opener_command(link).status().await?;
    if status.success() {
        info!("contact link opened");
    } else {
        warn!(%status, "opener exited unsuccessfully");
    }
    Ok(())
}

/// Demo: sign in with Kick from a terminal
///
/// Starts a loopback callback server, opens the browser on the Kick consent
/// page, completes the sign-in and prints the local user.
///
/// Setup:
/// 1. Register an app at https://kick.com/settings/developer
/// 2. Add http://127.0.0.1:8080/callback as redirect URL
/// 3. export KICK_CLIENT_ID=... KICK_CLIENT_SECRET=...
///    KICK_REDIRECT_URI=http://127.0.0.1:8080/callback
///
/// Run:
/// cargo run --example kick_login
use kick_session::prelude::*;
use std::sync::Arc;
use std::time::Duration;

fn main() {
    if let Err(e) = run() {
        eprintln!("\n✗ Sign-in failed: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let config = KickConfig::from_env()?;
    let server = CallbackServer::bind("127.0.0.1:8080")?;

    let store = Arc::new(FileStore::new("kick-session-demo")?);
    let collaborators = Collaborators::new(&config, store, Arc::new(MemoryUserDirectory::new()))?
        .with_refresh_lock(RefreshLockManager::for_app("kick-session-demo")?);
    let manager = SessionManager::new(config, collaborators);

    let existing = manager.check_session()?;
    if let Some(user) = existing.user {
        println!("Already signed in as {}", user.username);
        return Ok(());
    }

    println!("Opening the Kick sign-in page...");
    let flow = manager.login(&BrowserNavigator)?;
    println!("If the browser did not open, visit:\n{}\n", flow.url);

    let params = server.wait_for_callback(Duration::from_secs(300))?;
    let snapshot = manager.resume_from_callback(&params)?;

    if let Some(user) = snapshot.user {
        println!("✓ Signed in as {} <{}>", user.username, user.email);
        println!("  Kick id: {}", user.kick_id);
    }
    if let Some(deadline) = manager.refresh_deadline() {
        let remaining = deadline.saturating_duration_since(std::time::Instant::now());
        println!("  Token refresh scheduled in {}s", remaining.as_secs());
    }

    manager.shutdown();
    Ok(())
}

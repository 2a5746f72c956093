//! Print an argon2 hash for seeding a staff account by hand.
//!
//! Usage: `hashpass <username> [password]`; without a password argument the
//! password is read from the first line of stdin.

use std::io::BufRead;

use argon2::password_hash::{SaltString, rand_core::OsRng};
use argon2::{Argon2, PasswordHasher};

fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let username = args
        .next()
        .ok_or_else(|| anyhow::anyhow!("usage: hashpass <username> [password]"))?;

    let password = match args.next() {
        Some(p) => p,
        None => {
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line)?;
            line.trim_end_matches(['\r', '\n']).to_string()
        }
    };
    if password.chars().count() < 8 {
        anyhow::bail!("password must be at least 8 characters");
    }

    let salt = SaltString::generate(&mut OsRng);
    let phc = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("hashing failed: {e}"))?
        .to_string();

    println!("{phc}");
    eprintln!(
        "INSERT INTO staff_user (username, display_name, password_hash, role) \
         VALUES ('{}', '{}', '{phc}', 1);",
        username.to_lowercase(),
        username
    );
    Ok(())
}

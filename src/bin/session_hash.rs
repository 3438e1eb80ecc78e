//! Prints a bearer token and the hash to store in `session_tokens.token_hash`.
//! Usage: session_hash [token]   (a random token is generated when omitted)

use sha2::{Digest, Sha256};

fn main() {
    let token = std::env::args()
        .nth(1)
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
    let hash = hex::encode(Sha256::digest(token.as_bytes()));
    println!("token: {token}");
    println!("hash:  {hash}");
}

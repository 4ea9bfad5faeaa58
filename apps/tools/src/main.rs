use anyhow::Result;
use clap::{Parser, Subcommand};
use shared::{
    auth::{mint_app_token, verify_app_token},
    domain::UserId,
};

#[derive(Parser, Debug)]
struct Cli {
    /// Must match the relay's `app_token_secret`.
    #[arg(long, env = "APP_TOKEN_SECRET", default_value = "dev-app-secret")]
    secret: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    MintToken {
        user_id: String,
        name: String,
        #[arg(long)]
        image_url: Option<String>,
        #[arg(long, default_value_t = 86_400)]
        ttl_seconds: i64,
    },
    VerifyToken {
        token: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::MintToken {
            user_id,
            name,
            image_url,
            ttl_seconds,
        } => {
            let token = mint_app_token(
                &cli.secret,
                &UserId::new(user_id),
                &name,
                image_url.as_deref(),
                ttl_seconds,
            )?;
            println!("{token}");
        }
        Command::VerifyToken { token } => {
            let claims = verify_app_token(&cli.secret, &token)?;
            println!(
                "user_id={} name={} expires_at={}",
                claims.sub, claims.name, claims.exp
            );
        }
    }

    Ok(())
}

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use dialoguer::{Input, Password, theme::ColorfulTheme};
use tracing::info;
use xiaoqing_core::{
    AccountClient, ApiError, ChatController, ChatTransport, Config, Session, SmsPurpose,
    TurnEvent, TurnOutcome, logging,
};

mod app;
mod handler;
mod tui;
mod ui;
mod validate;

use app::App;
use tui::EventHandler;

#[derive(Parser)]
#[command(name = "xiaoqing")]
#[command(about = "Terminal client for the Xiaoqing streaming chat assistant")]
#[command(version)]
struct Cli {
    /// Backend base URL (overrides the config file and XIAOQING_BASE_URL)
    #[arg(long, global = true)]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the chat screen (default)
    Chat,
    /// Send one message and print the reply as it streams in
    Ask {
        /// The message to send
        message: String,
    },
    /// Log in with phone number and password
    Login {
        /// 11-digit phone number
        phone: Option<String>,
    },
    /// Create an account (sends a verification code by SMS)
    Register {
        phone: Option<String>,
        /// Use a code you already received instead of requesting a new one
        #[arg(long)]
        code: Option<String>,
    },
    /// Request an SMS verification code
    SendCode {
        phone: String,
        #[arg(long, value_enum, default_value_t = Purpose::Registration)]
        purpose: Purpose,
    },
    /// Check an SMS verification code without using it
    VerifyCode {
        phone: String,
        code: String,
        #[arg(long, value_enum, default_value_t = Purpose::Registration)]
        purpose: Purpose,
    },
    /// Set a new password using an SMS verification code
    ResetPassword {
        phone: Option<String>,
        #[arg(long)]
        code: Option<String>,
    },
    /// Change the password of the logged in account
    ChangePassword,
    /// Forget the stored login
    Logout,
    /// Print the effective configuration
    Config {
        /// Also write it to the config file
        #[arg(long)]
        save: bool,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Purpose {
    Registration,
    PasswordReset,
}

impl From<Purpose> for SmsPurpose {
    fn from(purpose: Purpose) -> Self {
        match purpose {
            Purpose::Registration => SmsPurpose::Registration,
            Purpose::PasswordReset => SmsPurpose::PasswordReset,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load()?;
    if let Some(base_url) = cli.base_url {
        config.base_url = base_url;
    }

    let command = cli.command.unwrap_or(Commands::Chat);
    if matches!(command, Commands::Chat) {
        // The terminal belongs to the chat screen
        logging::init_to_file(&config.log_level, &log_path()?)?;
    } else {
        logging::init("warn");
    }

    let session = Session::open_default()?;
    let accounts = AccountClient::from_config(&config, session.clone());

    match command {
        Commands::Chat => run_chat(&config, session).await?,
        Commands::Ask { message } => ask(&config, session, &message).await?,
        Commands::Login { phone } => login(&accounts, phone).await?,
        Commands::Register { phone, code } => register(&accounts, phone, code).await?,
        Commands::SendCode { phone, purpose } => {
            check(validate::phone(&phone))?;
            let receipt = accounts.send_sms(phone.trim(), purpose.into()).await?;
            print_receipt(&receipt.message, receipt.remaining);
        }
        Commands::VerifyCode { phone, code, purpose } => {
            check(validate::phone(&phone))?;
            accounts.verify_code(phone.trim(), code.trim(), purpose.into()).await?;
            println!("{}", "✓ Code is valid".green());
        }
        Commands::ResetPassword { phone, code } => reset_password(&accounts, phone, code).await?,
        Commands::ChangePassword => change_password(&accounts).await?,
        Commands::Logout => {
            session.clear();
            println!("{}", "Logged out".green());
        }
        Commands::Config { save } => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            if save {
                config.save()?;
                println!("{}", "✓ Saved".green());
            }
        }
    }

    Ok(())
}

fn log_path() -> Result<PathBuf> {
    let cache_dir = dirs::cache_dir().ok_or_else(|| anyhow!("Could not determine cache directory"))?;
    Ok(cache_dir.join("xiaoqing").join("xiaoqing.log"))
}

fn controller(config: &Config, session: Session) -> ChatController {
    let transport = ChatTransport::new(config.transport_config(), session);
    ChatController::new(transport, config.max_history_turns)
}

async fn run_chat(config: &Config, session: Session) -> Result<()> {
    if !session.is_logged_in() {
        println!(
            "{} run {} to chat with your account",
            "Not logged in:".yellow(),
            "xiaoqing login".bold()
        );
    }

    let mut app = App::new(controller(config, session));
    info!(base_url = %config.base_url, "starting chat screen");

    tui::install_panic_hook();
    let mut terminal = tui::init()?;
    let mut events = EventHandler::new();

    let result = async {
        while !app.should_quit {
            terminal.draw(|frame| ui::render(&mut app, frame))?;
            match events.next().await {
                Some(event) => handler::handle_event(&mut app, event)?,
                None => break,
            }
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;

    tui::restore()?;
    result
}

async fn ask(config: &Config, session: Session, message: &str) -> Result<()> {
    let mut controller = controller(config, session);
    controller.send_message(message)?;

    let mut stdout = std::io::stdout();
    // Bytes of the visible reply already written
    let mut printed = 0;
    while let Some(event) = controller.next_event().await {
        if let TurnEvent::Reconnecting { notice, .. } = &event {
            eprintln!("\n{}", notice.yellow());
            printed = 0;
        }

        let outcome = controller.handle_event(event);
        if let Some(text) = controller.reply_text() {
            let fresh = unprinted(text, printed);
            if !fresh.is_empty() {
                print!("{}", fresh);
                stdout.flush()?;
                printed = text.len();
            }
        }

        match outcome {
            Some(TurnOutcome::Failed(err)) => {
                println!();
                return Err(err.into());
            }
            Some(_) => break,
            None => {}
        }
    }
    println!();
    Ok(())
}

/// The part of `text` past the first `printed` bytes.
fn unprinted(text: &str, printed: usize) -> &str {
    text.get(printed..).unwrap_or(text)
}

async fn login(accounts: &AccountClient, phone: Option<String>) -> Result<()> {
    let theme = ColorfulTheme::default();
    let phone = match phone {
        Some(phone) => {
            check(validate::phone(&phone))?;
            phone.trim().to_string()
        }
        None => prompt_phone(&theme)?,
    };
    let password = Password::with_theme(&theme).with_prompt("Password").interact()?;
    if password.is_empty() {
        return Err(anyhow!("Please enter a password"));
    }

    accounts.login(&phone, &password).await?;
    println!("{} {}", "✓ Logged in as".green(), phone.bold());
    Ok(())
}

async fn register(accounts: &AccountClient, phone: Option<String>, code: Option<String>) -> Result<()> {
    let theme = ColorfulTheme::default();
    let phone = match phone {
        Some(phone) => {
            check(validate::phone(&phone))?;
            phone.trim().to_string()
        }
        None => prompt_phone(&theme)?,
    };

    let code = match code {
        Some(code) => code,
        None => {
            let receipt = accounts.send_sms(&phone, SmsPurpose::Registration).await?;
            print_receipt(&receipt.message, receipt.remaining);
            prompt_code(&theme)?
        }
    };
    accounts.verify_code(&phone, code.trim(), SmsPurpose::Registration).await?;

    let password = prompt_new_password(&theme, "Password")?;
    accounts.register(&phone, &password, code.trim()).await?;
    println!("{} {}", "✓ Registered and logged in as".green(), phone.bold());
    Ok(())
}

async fn reset_password(accounts: &AccountClient, phone: Option<String>, code: Option<String>) -> Result<()> {
    let theme = ColorfulTheme::default();
    let phone = match phone {
        Some(phone) => {
            check(validate::phone(&phone))?;
            phone.trim().to_string()
        }
        None => prompt_phone(&theme)?,
    };

    let code = match code {
        Some(code) => code,
        None => {
            let receipt = accounts.send_sms(&phone, SmsPurpose::PasswordReset).await?;
            print_receipt(&receipt.message, receipt.remaining);
            prompt_code(&theme)?
        }
    };

    let password = prompt_new_password(&theme, "New password")?;
    accounts.reset_password(&phone, code.trim(), &password).await?;
    println!("{} {}", "✓ Password reset, logged in as".green(), phone.bold());
    Ok(())
}

async fn change_password(accounts: &AccountClient) -> Result<()> {
    let session = accounts.session();
    if !session.is_logged_in() {
        return Err(ApiError::NotLoggedIn.into());
    }
    let phone = session.user_phone();

    let theme = ColorfulTheme::default();
    let old_password = Password::with_theme(&theme).with_prompt("Current password").interact()?;
    let new_password = prompt_new_password(&theme, "New password")?;
    if new_password == old_password {
        return Err(anyhow!("The new password must differ from the current one"));
    }

    accounts.change_password(&phone, &old_password, &new_password).await?;
    println!("{}", "✓ Password changed".green());
    Ok(())
}

fn prompt_phone(theme: &ColorfulTheme) -> Result<String> {
    let phone: String = Input::with_theme(theme)
        .with_prompt("Phone number")
        .validate_with(|input: &String| validate::phone(input))
        .interact_text()?;
    Ok(phone.trim().to_string())
}

fn prompt_code(theme: &ColorfulTheme) -> Result<String> {
    let code: String = Input::with_theme(theme)
        .with_prompt("Verification code")
        .validate_with(|input: &String| validate::code(input))
        .interact_text()?;
    Ok(code.trim().to_string())
}

fn prompt_new_password(theme: &ColorfulTheme, prompt: &str) -> Result<String> {
    loop {
        let password = Password::with_theme(theme)
            .with_prompt(prompt)
            .with_confirmation("Confirm password", "Passwords do not match")
            .interact()?;
        match validate::password(&password) {
            Ok(()) => return Ok(password),
            Err(message) => eprintln!("{}", message.red()),
        }
    }
}

fn print_receipt(message: &str, remaining: i64) {
    println!("{}", message.green());
    println!("{}", format!("{} codes left today", remaining).dimmed());
}

fn check(result: std::result::Result<(), String>) -> Result<()> {
    result.map_err(|message| anyhow!(message))
}

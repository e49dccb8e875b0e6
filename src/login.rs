use std::fmt::Display;

use anyhow::{Context, Result};
use log::debug;

use crate::EventBus;
use crate::input::InputBroker;
use crate::store::{CredentialStore, Credentials};
use crate::telegram::{ChannelApi, SignInOutcome};

const CODE_PROMPT: &str = "Enter the login code sent to your phone";
const PASSWORD_PROMPT: &str = "Enter your 2FA password";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoginState {
    Disconnected,
    Connecting,
    Unauthorized,
    AwaitingCode,
    AwaitingPassword,
    Authorized,
    Failed,
}

impl Display for LoginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Disconnected => "disconnected",
                Self::Connecting => "connecting",
                Self::Unauthorized => "unauthorized",
                Self::AwaitingCode => "awaiting code",
                Self::AwaitingPassword => "awaiting password",
                Self::Authorized => "authorized",
                Self::Failed => "failed",
            }
        )
    }
}

/// drive the connect / authorize / code / 2FA sequence to completion
///
/// credentials are persisted only after the whole sequence succeeds
pub(crate) async fn login(
    api: &dyn ChannelApi,
    broker: &InputBroker,
    store: &CredentialStore,
    credentials: &Credentials,
    events: &EventBus,
) -> Result<()> {
    match drive(api, broker, credentials, events).await {
        Ok(()) => {
            api.save_session().await?;
            store
                .save(credentials)
                .context("could not persist credentials")?;

            events.log("login successful");
            Ok(())
        }
        Err(error) => {
            transition(LoginState::Failed);
            Err(error)
        }
    }
}

async fn drive(
    api: &dyn ChannelApi,
    broker: &InputBroker,
    credentials: &Credentials,
    events: &EventBus,
) -> Result<()> {
    transition(LoginState::Disconnected);

    transition(LoginState::Connecting);
    api.connect().await?;

    if api.is_authorized().await? {
        transition(LoginState::Authorized);
        events.log("session already authorized");
        return Ok(());
    }

    transition(LoginState::Unauthorized);
    api.request_login_code(&credentials.phone).await?;

    transition(LoginState::AwaitingCode);
    let code = broker.request(CODE_PROMPT, events).await?;

    if api.sign_in_code(&code).await? == SignInOutcome::PasswordNeeded {
        transition(LoginState::AwaitingPassword);
        let password = broker.request(PASSWORD_PROMPT, events).await?;
        api.sign_in_password(&password).await?;
    }

    transition(LoginState::Authorized);
    Ok(())
}

fn transition(state: LoginState) {
    debug!("login state: {state}");
}

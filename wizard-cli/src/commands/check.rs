use async_trait::async_trait;
use color_eyre::eyre::Result;
use regex::Regex;

use libwizard::log::*;
use libwizard::state::CheckKey;

use super::{CliContext, Command, CommandErrors, Interactive};

pub struct CheckCommand;

#[async_trait]
impl<'a> Command<'a> for CheckCommand {
    fn new() -> Self {
        Self
    }

    async fn run(&self, context: &'a CliContext) -> Result<()> {
        let passed = context.session.run_checks().await;
        let checks = context.session.store().read(|state| state.checks.clone());
        for key in CheckKey::ALL {
            match checks.result(key) {
                Some(result) => {
                    let mark = if result.status { "ok" } else { "FAILED" };
                    println!("* {key}: {mark} ({})", result.message);
                }
                None => println!("* {key}: no result"),
            }
        }
        if passed {
            info!("all checks passed");
            println!("* all checks passed.");
            Ok(())
        } else {
            Err(CommandErrors::StepFailed("Not all checks passed.".into()))?
        }
    }
}

pub struct TokenCommand;

impl<'a> Interactive<'a> for TokenCommand {}

#[async_trait]
impl<'a> Command<'a> for TokenCommand {
    fn new() -> Self {
        Self
    }

    async fn run(&self, context: &'a CliContext) -> Result<()> {
        let printable = Regex::new(r"^\S+$")?;
        let token = self.read_argument_with_validator(context.matches, "token", &mut |input| {
            if printable.is_match(input) {
                Ok(())
            } else {
                Err(CommandErrors::InputValidationFailure(
                    "token".into(),
                    printable.as_str().into(),
                ))
            }
        })?;
        if context.session.verify_token(&token).await? {
            println!("* token is valid.");
            Ok(())
        } else {
            Err(CommandErrors::StepFailed("Token was rejected.".into()))?
        }
    }
}

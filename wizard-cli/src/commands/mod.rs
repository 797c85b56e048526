use async_trait::async_trait;
use clap::ArgMatches;
use color_eyre::eyre::{Result, WrapErr};
use dialoguer::{Input, Password};
use regex::Regex;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::fs;

use libwizard::state::{JobKind, JobStatus, WizardStore};
use libwizard::WizardSession;

pub mod check;
pub mod lmn;
pub mod setup;

#[derive(Error, Debug)]
pub enum CommandErrors {
    #[error("Prompt interaction failed.")]
    PromptInteractionFailed(
        #[from]
        #[source]
        dialoguer::Error,
    ),
    #[error("Required user input `{0}` is missing.")]
    RequiredUserInputMissing(String),
    #[error("Argument `{0}` failed validation `{1}`")]
    InputValidationFailure(String, String),
    #[error("Invalid subcommand `{0}`.")]
    InvalidSubcommand(String),
    #[error("{0}")]
    StepFailed(String),
}

pub struct CliContext<'a> {
    pub session: WizardSession,
    pub matches: &'a ArgMatches,
}

impl<'a> CliContext<'a> {
    pub fn new(session: WizardSession, matches: &'a ArgMatches) -> Self {
        Self { session, matches }
    }
}

#[async_trait]
pub trait Command<'a> {
    fn new() -> Self
    where
        Self: Sized;

    async fn run(&self, context: &'a CliContext) -> Result<()>;
}

pub trait Interactive<'a> {
    fn prompt_for_input_with_validator<V>(&self, message: &'a str, validator: V) -> Result<String>
    where
        V: FnMut(&String) -> Result<(), CommandErrors>,
    {
        Input::<String>::new()
            .with_prompt(message)
            .validate_with(validator)
            .interact_text()
            .map_err(CommandErrors::PromptInteractionFailed)
            .wrap_err("Prompting user input with validator failed.")
    }

    fn prompt_for_input_with_regex_validation(
        &self,
        message: &'a str,
        regex: &'a Regex,
    ) -> Result<String> {
        self.prompt_for_input_with_validator(message, |input: &String| {
            if regex.is_match(input) {
                Ok(())
            } else {
                Err(CommandErrors::InputValidationFailure(
                    message.to_string(),
                    regex.as_str().to_string(),
                ))
            }
        })
    }

    fn prompt_for_password(&self, message: &'a str) -> Result<String> {
        Password::new()
            .with_prompt(message)
            .interact()
            .map_err(CommandErrors::PromptInteractionFailed)
            .wrap_err("Prompting for password failed.")
    }

    /// Read argument from the CLI args with a validation function.
    fn read_argument_with_validator<V>(
        &self,
        arg_matches: &'a ArgMatches,
        id: &'a str,
        validator: &mut V,
    ) -> Result<String>
    where
        V: FnMut(&String) -> Result<(), CommandErrors>,
    {
        if let Some(arg) = arg_matches.get_one::<String>(id) {
            validator(arg)?;
            Ok(arg.clone())
        } else {
            Err(CommandErrors::RequiredUserInputMissing(id.into()))?
        }
    }

    /// Read argument from the CLI args with regex validation, prompting for
    /// it when it was not given.
    fn read_or_prompt_with_regex_validation(
        &self,
        arg_matches: &'a ArgMatches,
        id: &'a str,
        message: &'a str,
        regex: &'a Regex,
    ) -> Result<String> {
        if arg_matches.contains_id(id) {
            self.read_argument_with_validator(arg_matches, id, &mut |input| {
                if regex.is_match(input) {
                    Ok(())
                } else {
                    Err(CommandErrors::InputValidationFailure(
                        id.into(),
                        regex.as_str().into(),
                    ))
                }
            })
        } else {
            self.prompt_for_input_with_regex_validation(message, regex)
        }
    }
}

/// Read and deserialize a YAML input file.
pub async fn read_yaml<T: DeserializeOwned>(path: &str) -> Result<T> {
    let raw = fs::read_to_string(path)
        .await
        .wrap_err_with(|| format!("Failed reading {path}"))?;
    serde_yaml::from_str(&raw).wrap_err_with(|| format!("Failed deserializing {path}"))
}

/// Print job output as it lands in the store until the job reaches a
/// terminal status.
pub async fn follow_output(store: &WizardStore, kind: JobKind) -> JobStatus {
    let mut rx = store.subscribe();
    let mut seen = None;
    loop {
        let status = {
            let state = rx.borrow_and_update();
            for line in state.lmn_output.since(seen) {
                println!("{}", line.text);
                seen = Some(line.id);
            }
            state.job_status(kind)
        };
        if status.is_terminal() {
            return status;
        }
        if rx.changed().await.is_err() {
            return store.job_status(kind);
        }
    }
}

/// Turn the job's final state into the command's result.
pub fn job_result(store: &WizardStore, kind: JobKind) -> Result<()> {
    store.read(|state| state.job_result(kind))?;
    println!("* {kind} completed.");
    Ok(())
}

use async_trait::async_trait;
use color_eyre::eyre::Result;

use libwizard::finalize::RedirectReason;
use libwizard::log::*;
use libwizard::state::ConfigurationBundle;

use super::{read_yaml, CliContext, Command, CommandErrors};

pub struct ConfigureCommand;

#[async_trait]
impl<'a> Command<'a> for ConfigureCommand {
    fn new() -> Self {
        Self
    }

    async fn run(&self, context: &'a CliContext) -> Result<()> {
        let session = &context.session;
        let answers = context
            .matches
            .get_one::<String>("answers")
            .ok_or_else(|| CommandErrors::RequiredUserInputMissing("answers".into()))?;
        let bundle: ConfigurationBundle = read_yaml(answers).await?;
        debug!("configuration answers: {:?}", bundle);
        session.store().set_configuration(bundle);

        if let Some(group) = context.matches.get_one::<String>("admin-group") {
            session.set_admin_group(group).await?;
            println!("* admin group set to {group}.");
        }
        let response = session.submit_configuration().await?;
        println!("* configuration saved: {}", response.message);
        Ok(())
    }
}

pub struct FinishCommand;

#[async_trait]
impl<'a> Command<'a> for FinishCommand {
    fn new() -> Self {
        Self
    }

    async fn run(&self, context: &'a CliContext) -> Result<()> {
        let mut handle = context.session.finalize(|target, reason| match reason {
            RedirectReason::Reachable => println!("* {target} is up, continue there."),
            RedirectReason::Fallback => {
                println!("* gave up waiting, {target} should be up by now. Continue there.")
            }
        })?;
        let target = context.session.config().target_url()?;
        println!("* setup committed, waiting for {target} to come back up...");

        let mut status = handle.subscribe();
        let mut announced = false;
        loop {
            let current = status.borrow_and_update().clone();
            if current.manual_link_available && !announced {
                announced = true;
                println!("* taking a while. You can open {target} yourself.");
            }
            if current.redirect.is_some() {
                break;
            }
            tokio::select! {
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    warn!("interrupted, stopping the handoff");
                    handle.cancel();
                    break;
                }
            }
        }
        handle.wait().await;
        Ok(())
    }
}

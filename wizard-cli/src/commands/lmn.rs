use async_trait::async_trait;
use color_eyre::eyre::{Result, WrapErr};
use regex::Regex;
use tokio::fs;

use libwizard::api::{RequirementStatus, RequirementsResponse, SshConnection};
use libwizard::log::*;
use libwizard::state::{JobKind, LmnConfig};

use super::{
    follow_output, job_result, read_yaml, CliContext, Command, CommandErrors, Interactive,
};

pub struct BootstrapCommand;

impl<'a> Interactive<'a> for BootstrapCommand {}

impl BootstrapCommand {
    async fn read_password(&self, context: &CliContext<'_>) -> Result<String> {
        match context.matches.get_one::<String>("password-file") {
            Some(path) => {
                let password = fs::read_to_string(path)
                    .await
                    .wrap_err_with(|| format!("Failed reading password file {path}"))?;
                Ok(password.trim_end_matches(['\r', '\n']).to_string())
            }
            None => self.prompt_for_password("SSH password"),
        }
    }
}

#[async_trait]
impl<'a> Command<'a> for BootstrapCommand {
    fn new() -> Self {
        Self
    }

    async fn run(&self, context: &'a CliContext) -> Result<()> {
        let host_regex = Regex::new(r"^[A-Za-z0-9.:\-\[\]]+$")?;
        let host = self.read_or_prompt_with_regex_validation(
            context.matches,
            "host",
            "Server address",
            &host_regex,
        )?;
        let port = context
            .matches
            .get_one::<u16>("port")
            .copied()
            .unwrap_or(22);
        let user = self.read_argument_with_validator(context.matches, "user", &mut |_| Ok(()))?;
        let password = self.read_password(context).await?;

        let ssh = SshConnection::new(host, port, user, password);
        let reachable = context.session.check_lmn_connection(&ssh.host).await;
        if let Err(err) = reachable {
            warn!("connection check for {} failed: {}", ssh.host, err);
            println!("* warning: {} did not pass the connection check.", ssh.host);
        }

        println!("* bootstrapping {}:{} as {}", ssh.host, ssh.port, ssh.user);
        let mut handle = context.session.bootstrap(ssh).await?;
        let status = follow_output(context.session.store(), JobKind::Bootstrap).await;
        debug!("bootstrap ended {}", status);
        handle.wait().await;
        context.session.store().clear_ssh();
        job_result(context.session.store(), JobKind::Bootstrap)
    }
}

pub struct RequirementsCommand;

impl RequirementsCommand {
    fn print(&self, requirements: &RequirementsResponse) {
        println!("* requirements for {}:", requirements.playbook);
        for check in &requirements.checks {
            let mark = match check.status {
                RequirementStatus::Passed => "ok",
                RequirementStatus::Failed => "FAILED",
                RequirementStatus::Skipped => "skipped",
            };
            println!("** {}: {} ({})", check.name, mark, check.message);
        }
        let info = &requirements.system_info;
        if let (Some(os), Some(version)) = (&info.os, &info.os_version) {
            println!("** system: {os} {version}");
        }
        if let Some(ram) = info.ram_gb {
            println!("** ram: {ram:.1} GB");
        }
        for disk in &info.disks {
            println!("** disk {}: {:.1} GB", disk.name, disk.size_gb);
        }
    }
}

#[async_trait]
impl<'a> Command<'a> for RequirementsCommand {
    fn new() -> Self {
        Self
    }

    async fn run(&self, context: &'a CliContext) -> Result<()> {
        let playbook = context
            .matches
            .get_one::<String>("playbook")
            .ok_or_else(|| CommandErrors::RequiredUserInputMissing("playbook".into()))?;
        match context.session.check_requirements(playbook).await {
            Some(requirements) if requirements.all_passed => {
                self.print(&requirements);
                println!("* all requirements met.");
                Ok(())
            }
            Some(requirements) => {
                self.print(&requirements);
                Err(CommandErrors::StepFailed("Requirements not met.".into()))?
            }
            None => Err(CommandErrors::StepFailed(
                "Could not fetch the requirements.".into(),
            ))?,
        }
    }
}

pub struct InstallCommand;

#[async_trait]
impl<'a> Command<'a> for InstallCommand {
    fn new() -> Self {
        Self
    }

    async fn run(&self, context: &'a CliContext) -> Result<()> {
        let matches = context.matches;
        let session = &context.session;
        let vars = matches
            .get_one::<String>("vars")
            .ok_or_else(|| CommandErrors::RequiredUserInputMissing("vars".into()))?;
        let playbook = matches
            .get_one::<String>("playbook")
            .ok_or_else(|| CommandErrors::RequiredUserInputMissing("playbook".into()))?;
        let lmn: LmnConfig = read_yaml(vars).await?;
        debug!("server settings: {:?}", lmn);
        session.store().set_lmn_config(lmn);

        session
            .lmn_installer_health()
            .await
            .wrap_err("The linuxmuster.net installer is not ready")?;

        if !matches.get_flag("skip-requirements") {
            session.check_requirements(playbook).await;
            if !session.store().read(|state| state.lmn_requirements_passed) {
                return Err(CommandErrors::StepFailed(format!(
                    "Requirements for {playbook} not met. Run `requirements` for details."
                ))
                .into());
            }
        }

        println!("* running {playbook}");
        let mut handle = session.install(playbook).await?;
        let status = follow_output(session.store(), JobKind::Playbook).await;
        debug!("install playbook ended {}", status);
        handle.cancel();
        handle.wait().await;
        job_result(session.store(), JobKind::Playbook)?;

        let derived = session.fetch_derived_config().await?;
        println!("* bind user: {}", derived.binduser_dn);
        if let Err(err) = session.shutdown_lmn_installer().await {
            // it may have shut down on its own already
            debug!("stopping the linuxmuster.net installer failed: {}", err);
        }
        Ok(())
    }
}

//! The supervisor: schedules planned analyzers as subprocesses and brokers
//! their authenticated requests over a line-delimited JSON socket.
//!
//! A single task owns the agent map; socket handlers and subprocess
//! watchers talk to it through a mailbox, which keeps the whole component
//! cooperatively single-threaded.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use rand::RngCore;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use kairos_core::config::{DataServiceConfig, SupervisorConfig};
use kairos_core::{
    honour_wish, AnalyzerFailure, AnalyzerState, AnalyzerStore as _, Domain, ExecutionResult,
    GrantStore as _, IdFactory as _, OwnerDomain, ScratchStore as _, TransitionEffects,
    AGENT_ID_COUNTER, MODULE_PREFIX, NO_ACTION_ID, ONLINE_PREFIX,
};

use crate::prelude::Error;

pub mod agent;
pub mod protocol;

use agent::{Agent, BrokerContext};
use protocol::BrokerRequest;

pub const TICK_INTERVAL: Duration = Duration::from_secs(4);

/// How much captured stderr makes it into the error reason.
const STDERR_REPORT_LIMIT: usize = 4096;

pub enum SupervisorMsg {
    Request {
        request: BrokerRequest,
        reply: oneshot::Sender<Value>,
    },
    ModuleDone {
        identifier: String,
        outcome: ModuleOutcome,
    },
}

pub struct ModuleOutcome {
    pub result: Result<std::process::ExitStatus, std::io::Error>,
    pub stdout: String,
    pub stderr: String,
}

pub struct Supervisor<D: Domain> {
    domain: D,
    config: SupervisorConfig,
    ctx: BrokerContext,
    agents: HashMap<String, Agent>,
    mailbox: mpsc::Sender<SupervisorMsg>,
}

fn generate_token() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn split_listen_address(listen_address: &str) -> Result<(String, u16), Error> {
    let (host, port) = listen_address
        .rsplit_once(':')
        .ok_or_else(|| Error::config("supervisor listen_address must be host:port"))?;

    let port = port
        .parse()
        .map_err(|_| Error::config("supervisor listen_address carries an invalid port"))?;

    Ok((host.to_string(), port))
}

impl<D: Domain> Supervisor<D> {
    fn new(
        domain: D,
        config: SupervisorConfig,
        data_service: DataServiceConfig,
        mailbox: mpsc::Sender<SupervisorMsg>,
    ) -> Result<Self, Error> {
        let (host, port) = split_listen_address(&config.listen_address)?;

        let ctx = BrokerContext {
            environment: domain.environment().to_string(),
            data_service_url: data_service.url,
            host,
            port,
            spark: config.spark.clone(),
            distributed: config.distributed.clone(),
        };

        Ok(Self {
            domain,
            config,
            ctx,
            agents: HashMap::new(),
            mailbox,
        })
    }

    /// Drop leftover credentials carrying reserved prefixes; they are
    /// orphans of a crashed predecessor. Scratch scopes are left alone: an
    /// executed run awaiting validation still owns one.
    fn boot_cleanup(&self) -> Result<(), Error> {
        for prefix in [MODULE_PREFIX, ONLINE_PREFIX] {
            for identifier in self.domain.grants().identifiers_with_prefix(prefix)? {
                info!(%identifier, "dropping leftover grant");
                self.domain.grants().revoke(&identifier)?;
            }
        }

        Ok(())
    }

    /// Create an online agent for an interactive session and return its
    /// credentials.
    fn create_online_agent(&mut self) -> Result<Value, Error> {
        let identifier = format!("{ONLINE_PREFIX}{}", self.domain.ids().next_id(AGENT_ID_COUNTER)?);
        let token = generate_token();

        let agent = Agent::prepare_online(&self.domain, identifier.clone(), token.clone())?;
        self.agents.insert(identifier.clone(), agent);

        Ok(json!({
            "identifier": identifier,
            "token": token,
            "host": self.ctx.host,
            "port": self.ctx.port,
        }))
    }

    fn shutdown_online_agents(&mut self) {
        let online: Vec<String> = self
            .agents
            .values()
            .filter(|a| a.online)
            .map(|a| a.identifier.clone())
            .collect();

        for identifier in online {
            if let Some(agent) = self.agents.remove(&identifier) {
                agent.teardown(&self.domain, false);
            }
        }
    }

    /// Scan for planned analyzers and start executing them.
    fn check_for_work(&mut self) -> Result<(), Error> {
        debug!("check for work");

        let planned = self
            .domain
            .analyzers()
            .in_states(&[AnalyzerState::Planned])?;

        for analyzer in planned {
            if honour_wish(self.domain.analyzers(), &analyzer, OwnerDomain::Supervisor)? {
                continue;
            }

            let id = analyzer.id.clone();
            if let Err(error) = self.execute_analyzer(&analyzer) {
                warn!(analyzer = %id, %error, "failed to start analyzer");

                self.domain.analyzers().fail(
                    &id,
                    OwnerDomain::Supervisor,
                    &format!("error while preparing execution: {error}"),
                )?;
            }
        }

        Ok(())
    }

    fn execute_analyzer(&mut self, analyzer: &kairos_core::AnalyzerRecord) -> Result<(), Error> {
        info!(analyzer = %analyzer.id, "executing analyzer");

        let Some(program) = analyzer.command_line.first() else {
            return Err(Error::agent("analyzer has an empty command line"));
        };

        let identifier = format!("{MODULE_PREFIX}{}", self.domain.ids().next_id(AGENT_ID_COUNTER)?);
        let token = generate_token();

        let agent = Agent::prepare_module(
            &self.domain,
            analyzer,
            identifier.clone(),
            token.clone(),
            self.config.ensure_clean_repo,
        )?;

        let moved = self.domain.analyzers().transition(
            &analyzer.id,
            AnalyzerState::Planned,
            AnalyzerState::Executing,
            TransitionEffects::none(),
        )?;

        if !moved {
            // lost the race; undo what we acquired
            agent.teardown(&self.domain, false);
            return Ok(());
        }

        let credentials = json!({
            "identifier": identifier,
            "token": token,
            "host": self.ctx.host,
            "port": self.ctx.port,
        });

        let mut command = tokio::process::Command::new(program);

        command
            .args(&analyzer.command_line[1..])
            .current_dir(&analyzer.working_dir)
            .env("PTO_CREDENTIALS", credentials.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        self.agents.insert(identifier.clone(), agent);

        let mailbox = self.mailbox.clone();

        tokio::spawn(async move {
            let outcome = match command.output().await {
                Ok(output) => ModuleOutcome {
                    result: Ok(output.status),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                },
                Err(error) => ModuleOutcome {
                    result: Err(error),
                    stdout: String::new(),
                    stderr: String::new(),
                },
            };

            let _ = mailbox
                .send(SupervisorMsg::ModuleDone {
                    identifier,
                    outcome,
                })
                .await;
        });

        info!(analyzer = %analyzer.id, "module agent started");
        Ok(())
    }

    /// A module subprocess finished: tear down its credentials and either
    /// hand the run to the validator or move the analyzer to `error`.
    fn module_done(&mut self, identifier: &str, outcome: ModuleOutcome) -> Result<(), Error> {
        let Some(agent) = self.agents.remove(identifier) else {
            warn!(%identifier, "finished module has no agent on record");
            return Ok(());
        };

        debug!(stdout = %outcome.stdout, "module output");

        let failure_reason = match &outcome.result {
            Ok(status) if status.success() => None,
            Ok(status) => {
                let mut stderr = outcome.stderr.clone();
                stderr.truncate(STDERR_REPORT_LIMIT);
                Some(format!("analyzer module exited with {status}:\n{stderr}"))
            }
            Err(error) => Some(format!("failed to run analyzer module: {error}")),
        };

        match failure_reason {
            Some(reason) => {
                error!(analyzer = %agent.analyzer_id, %reason, "module execution failed");
                agent.teardown(&self.domain, false);

                let effects = TransitionEffects::error(AnalyzerFailure::new(
                    OwnerDomain::Supervisor,
                    reason.as_str(),
                ));

                self.domain.analyzers().transition(
                    &agent.analyzer_id,
                    AnalyzerState::Executing,
                    AnalyzerState::Error,
                    effects,
                )?;
            }
            None => {
                // scratch stays alive for the validator
                agent.teardown(&self.domain, true);

                let result = ExecutionResult {
                    scratch_scope: agent.scratch_scope.clone(),
                    max_action_id: agent.result_max_action_id.unwrap_or(NO_ACTION_ID),
                    timespans: agent.result_timespans.clone(),
                    upload_ids: agent.result_upload_ids.clone(),
                };

                let effects = TransitionEffects {
                    set_execution_result: Some(result),
                    ..TransitionEffects::default()
                };

                let moved = self.domain.analyzers().transition(
                    &agent.analyzer_id,
                    AnalyzerState::Executing,
                    AnalyzerState::Executed,
                    effects,
                )?;

                if moved {
                    info!(analyzer = %agent.analyzer_id, "module agent done");
                } else {
                    warn!(analyzer = %agent.analyzer_id, "analyzer left executing state mid-run");
                    self.domain.scratch().drop_scope(&agent.scratch_scope)?;
                }
            }
        }

        Ok(())
    }

    fn handle_request(&mut self, request: BrokerRequest) -> Value {
        let ctx = self.ctx.clone();

        let Some(agent) = self.agents.get_mut(&request.identifier) else {
            debug!(identifier = %request.identifier, "no analyzer with this identifier");
            return json!({
                "error": "authentication failed, analyzer not on record with this identifier"
            });
        };

        if agent.token != request.token {
            return json!({"error": "authentication failed, token incorrect"});
        }

        agent.handle_request(&request.action, request.payload, &ctx)
    }

    fn handle_msg(&mut self, msg: SupervisorMsg) -> Result<(), Error> {
        match msg {
            SupervisorMsg::Request { request, reply } => {
                let answer = self.handle_request(request);
                let _ = reply.send(answer);
            }
            SupervisorMsg::ModuleDone {
                identifier,
                outcome,
            } => {
                self.module_done(&identifier, outcome)?;
            }
        }

        Ok(())
    }
}

/// Bind the broker socket and start the supervisor. Returns the bound
/// address and the join handle of the actor task.
pub async fn spawn<D: Domain>(
    domain: D,
    config: SupervisorConfig,
    data_service: DataServiceConfig,
    cancel: CancellationToken,
) -> Result<(std::net::SocketAddr, tokio::task::JoinHandle<Result<(), Error>>), Error> {
    let (tx, mut rx) = mpsc::channel::<SupervisorMsg>(64);

    let mut supervisor = Supervisor::new(domain, config, data_service, tx.clone())?;

    supervisor.boot_cleanup()?;

    let listener = TcpListener::bind(&supervisor.config.listen_address)
        .await
        .map_err(Error::server)?;

    let local_addr = listener.local_addr().map_err(Error::server)?;
    info!(addr = %local_addr, "request broker is listening");

    let credentials = supervisor.create_online_agent()?;
    info!("online agent ready");
    info!("export PTO_CREDENTIALS='{credentials}'");

    let accept_cancel = cancel.clone();
    let accept_tx = tx.clone();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = accept_cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "accepting incoming connection");
                        tokio::spawn(protocol::handle_connection(stream, accept_tx.clone()));
                    }
                    Err(error) => {
                        warn!(%error, "error on incoming connection");
                    }
                },
            }
        }
    });

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => supervisor.handle_msg(msg)?,
                    None => break,
                },
                _ = ticker.tick() => supervisor.check_for_work()?,
            }
        }

        supervisor.shutdown_online_agents();
        Ok(())
    });

    Ok((local_addr, handle))
}

/// Convenience wrapper running the supervisor until cancelled.
pub async fn run<D: Domain>(
    domain: D,
    config: SupervisorConfig,
    data_service: DataServiceConfig,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let (_, handle) = spawn(domain, config, data_service, cancel).await?;
    handle.await.map_err(Error::server)?
}

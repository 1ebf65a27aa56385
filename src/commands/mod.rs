//! CLI subcommand implementations
//!
//! Thin consumers of the engine's session API. Exit codes map result
//! codes: 0 complete, 2 timed out, 3 cost exceeded, 4 killed, 5 paused
//! awaiting answers, 1 failure.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use bo1_engine::collect::MapAnswerSource;
use bo1_engine::graph::GraphOutcome;
use bo1_engine::safety::Actor;
use bo1_engine::types::{OwnerId, ResultCode, SessionId};
use bo1_engine::{EngineConfig, SessionManager};

fn default_owner(owner: Option<String>) -> OwnerId {
    OwnerId::new(
        owner
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "local".to_string()),
    )
}

fn parse_answers(pairs: &[String]) -> anyhow::Result<HashMap<String, String>> {
    let mut answers = HashMap::new();
    for pair in pairs {
        let (question, answer) = pair
            .split_once('=')
            .with_context(|| format!("--answer {:?} is not question=answer", pair))?;
        answers.insert(question.trim().to_string(), answer.trim().to_string());
    }
    Ok(answers)
}

fn manager() -> anyhow::Result<SessionManager> {
    let config = EngineConfig::from_env();
    SessionManager::from_config(config).context("engine configuration failed (is LLM_API_KEY set?)")
}

fn exit_code_for(result: &ResultCode) -> i32 {
    match result {
        ResultCode::Complete => 0,
        ResultCode::TimedOut => 2,
        ResultCode::CostExceeded => 3,
        ResultCode::KilledByUser | ResultCode::KilledByAdmin => 4,
        ResultCode::Failed(_) => 1,
    }
}

async fn run_session(
    manager: &SessionManager,
    session_id: SessionId,
    actor: &Actor,
    answers: HashMap<String, String>,
) -> anyhow::Result<i32> {
    let source = Arc::new(MapAnswerSource::new(answers));
    // Ctrl-C cancels the run; the latest node-boundary checkpoint is
    // already persisted, so the session stays resumable.
    let run = manager.run_to_completion(session_id, actor, source);
    tokio::pin!(run);
    let (state, outcome) = tokio::select! {
        result = &mut run => result.context("deliberation failed")?,
        _ = tokio::signal::ctrl_c() => {
            manager.shutdown().await;
            eprintln!(
                "\ninterrupted; latest checkpoint preserved — continue with: bo1 resume {}",
                session_id
            );
            return Ok(130);
        }
    };

    match outcome {
        GraphOutcome::Paused { unanswered } => {
            eprintln!("The panel needs answers before it can continue:");
            for question in &unanswered {
                eprintln!("  - {}", question);
            }
            eprintln!(
                "\nResume with:\n  bo1 resume {} --answer \"{}=...\"",
                session_id,
                unanswered.first().map(String::as_str).unwrap_or("question")
            );
            Ok(5)
        }
        GraphOutcome::Completed(result) => {
            if let Some(synthesis) = &state.synthesis_text {
                println!("{}\n", synthesis);
            }
            if let Some(aggregation) = &state.aggregation {
                println!("Consensus: {}", aggregation.consensus_recommendation);
                if !aggregation.dissenting_views.is_empty() {
                    println!("Dissent:");
                    for view in &aggregation.dissenting_views {
                        println!("  - {}", view);
                    }
                }
            }
            eprintln!(
                "\nsession {} · {:?} · ${:.4} across {} calls",
                session_id, result, state.metrics.total_cost, state.metrics.llm_calls
            );
            Ok(exit_code_for(&result))
        }
    }
}

pub async fn deliberate(
    problem: String,
    context: Option<String>,
    owner: Option<String>,
    answer_pairs: Vec<String>,
    export_json: Option<std::path::PathBuf>,
    export_md: Option<std::path::PathBuf>,
) -> anyhow::Result<i32> {
    let manager = manager()?;
    let owner = default_owner(owner);
    let actor = Actor::User(owner.clone());
    let answers = parse_answers(&answer_pairs)?;

    let (session_id, _) = manager
        .create_session(owner, problem, context)
        .await
        .context("session creation failed")?;
    eprintln!("session {}", session_id);

    let code = run_session(&manager, session_id, &actor, answers).await?;

    if export_json.is_some() || export_md.is_some() {
        let state = manager.get(session_id, &actor).await?;
        if let Some(path) = export_json {
            std::fs::write(&path, bo1_engine::to_json(&state)?)
                .with_context(|| format!("writing {}", path.display()))?;
            eprintln!("wrote {}", path.display());
        }
        if let Some(path) = export_md {
            std::fs::write(&path, bo1_engine::to_markdown(&state))
                .with_context(|| format!("writing {}", path.display()))?;
            eprintln!("wrote {}", path.display());
        }
    }
    Ok(code)
}

pub async fn resume(
    session_id: String,
    owner: Option<String>,
    answer_pairs: Vec<String>,
) -> anyhow::Result<i32> {
    let manager = manager()?;
    let session_id: SessionId = session_id.parse().context("invalid session id")?;
    let actor = Actor::User(default_owner(owner));
    let answers = parse_answers(&answer_pairs)?;
    run_session(&manager, session_id, &actor, answers).await
}

pub async fn sessions(owner: Option<String>, admin: bool) -> anyhow::Result<i32> {
    let manager = manager()?;
    let summaries = if admin {
        manager
            .list_active(&Actor::Admin {
                admin_id: default_owner(owner).to_string(),
            })
            .await?
    } else {
        manager.list_by_owner(&default_owner(owner)).await?
    };

    if summaries.is_empty() {
        println!("no sessions");
        return Ok(0);
    }
    for s in summaries {
        println!(
            "{}  {:12}  {}  {}",
            s.session_id,
            s.phase.to_string(),
            s.owner_id,
            s.updated_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(0)
}

pub async fn kill(
    session_id: String,
    owner: Option<String>,
    admin: bool,
    reason: Option<String>,
) -> anyhow::Result<i32> {
    let manager = manager()?;
    let session_id: SessionId = session_id.parse().context("invalid session id")?;
    let actor = if admin {
        Actor::Admin {
            admin_id: default_owner(owner).to_string(),
        }
    } else {
        Actor::User(default_owner(owner))
    };

    let result = manager.kill(session_id, &actor, reason).await?;
    println!("{} → {:?}", session_id, result);
    Ok(0)
}

pub async fn export(
    session_id: String,
    owner: Option<String>,
    format: String,
) -> anyhow::Result<i32> {
    let manager = manager()?;
    let session_id: SessionId = session_id.parse().context("invalid session id")?;
    let state = manager
        .get(session_id, &Actor::User(default_owner(owner)))
        .await?;

    match format.as_str() {
        "json" => println!("{}", bo1_engine::to_json(&state)?),
        "markdown" | "md" => println!("{}", bo1_engine::to_markdown(&state)),
        other => anyhow::bail!("unknown format {:?}; use json or markdown", other),
    }
    Ok(0)
}

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

use std::{
    fs,
    path::{Path, PathBuf},
    process::ExitCode,
    time::Duration,
};

use change_in::{
    CompilationLog, Deepening, Error, Evaluator, GitOptions, History as _, RefType, RepoContext,
    Rewriter,
};
use clap::{Args, Parser as ClapParser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Replace `change_in` calls in a pipeline's `when` conditions with
    /// `true` or `false`.
    Compile(CompileArgs),
}

#[derive(Args, Debug)]
pub struct CompileArgs {
    /// The pipeline file to read.
    #[arg(long)]
    pub input: PathBuf,

    /// Where to write the rewritten pipeline.
    #[arg(long)]
    pub output: PathBuf,

    /// Where to write the log of resolved calls. Written even when
    /// compilation fails.
    #[arg(long)]
    pub logs: PathBuf,

    /// The repository to inspect. By default, the one containing the input.
    #[arg(long)]
    pub repository: Option<PathBuf>,

    /// The commit being built. By default, HEAD is used.
    #[arg(long, env = "SEMAPHORE_GIT_SHA")]
    pub sha: Option<String>,

    /// What triggered the build: branch, pull-request or tag.
    #[arg(long, env = "SEMAPHORE_GIT_REF_TYPE", default_value = "branch")]
    pub ref_type: RefType,

    /// The branch being built, or the target branch of a pull request.
    #[arg(long, env = "SEMAPHORE_GIT_BRANCH")]
    pub branch: Option<String>,

    /// The head branch of a pull request.
    #[arg(long, env = "SEMAPHORE_GIT_PR_BRANCH")]
    pub pr_branch: Option<String>,

    /// The depth the repository was cloned with, if known.
    #[arg(long, env = "SEMAPHORE_GIT_DEPTH")]
    pub git_depth: Option<u32>,

    /// Never fetch from the remote. Missing history resolves to `true`.
    #[arg(long, env = "CHANGE_IN_NO_FETCH")]
    pub no_fetch: bool,

    /// Commits fetched by the first deepening of a shallow clone. Each later
    /// attempt doubles it.
    #[arg(long, default_value_t = 50)]
    pub deepen_step: u32,

    /// Deepening attempts before fetching the full history.
    #[arg(long, default_value_t = 5)]
    pub max_deepen_attempts: u32,

    /// Seconds an external git command may run.
    #[arg(long, default_value_t = 120)]
    pub git_timeout: u64,

    /// The git binary used for fetching.
    #[arg(long, env = "CHANGE_IN_GIT", default_value = "git")]
    pub git_binary: PathBuf,

    /// The remote to fetch from.
    #[arg(long, default_value = "origin")]
    pub remote: String,
}

fn run(args: CompileArgs) -> Result<(), Error> {
    let mut log = CompilationLog::default();
    let compiled = compile(&args, &mut log);
    let logged = log.write(&args.logs);
    compiled.and(logged)
}

fn compile(args: &CompileArgs, log: &mut CompilationLog) -> Result<(), Error> {
    let source = fs::read_to_string(&args.input).map_err(|source| Error::Read {
        path: args.input.clone(),
        source,
    })?;
    let mut document: serde_yaml::Value =
        serde_yaml::from_str(&source).map_err(|source| Error::Yaml {
            path: args.input.clone(),
            source,
        })?;

    let repository = match &args.repository {
        Some(repository) => repository.clone(),
        None => pipeline_parent(&args.input),
    };
    let mut engine = change_in::git(
        &repository,
        GitOptions {
            program: args.git_binary.clone(),
            remote: args.remote.clone(),
            timeout: Duration::from_secs(args.git_timeout),
        },
    )?;
    let context = RepoContext::new(
        args.ref_type,
        args.sha.clone(),
        args.branch.clone(),
        args.pr_branch.clone(),
    )?
    .with_shallow(engine.is_shallow())
    .with_fetch_depth(args.git_depth);
    info!(?context, "build context");

    let deepening = Deepening {
        enabled: !args.no_fetch,
        step: args.deepen_step.max(1),
        max_attempts: args.max_deepen_attempts,
    };
    let base = match engine.workdir() {
        Some(workdir) => pipeline_dir(&args.input, workdir),
        None => PathBuf::new(),
    };
    debug!(base = %base.display(), "resolving relative filters");

    let evaluator = Evaluator::new(&mut engine, &context, &deepening);
    Rewriter::new(evaluator, base).rewrite(&mut document, log)?;

    let output = serde_yaml::to_string(&document).map_err(|source| Error::Serialize {
        path: args.output.clone(),
        source,
    })?;
    fs::write(&args.output, output).map_err(|source| Error::Write {
        path: args.output.clone(),
        source,
    })
}

fn pipeline_parent(input: &Path) -> PathBuf {
    match input.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_owned(),
        _ => PathBuf::from("."),
    }
}

/// Directory of the pipeline file relative to the repository root, or the
/// root when the file lives outside the working tree.
fn pipeline_dir(input: &Path, workdir: &Path) -> PathBuf {
    let (Ok(input), Ok(workdir)) = (input.canonicalize(), workdir.canonicalize()) else {
        return PathBuf::new();
    };
    input
        .parent()
        .and_then(|parent| parent.strip_prefix(&workdir).ok())
        .map(Path::to_owned)
        .unwrap_or_default()
}

#[cfg_attr(coverage_nightly, coverage(off))]
fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();

    let Command::Compile(args) = Cli::parse().command;
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use change_in::{testing::Sandbox, HistoryError, LogEntry};
    use indoc::indoc;
    use tempfile::TempDir;

    use super::*;

    const PIPELINE: &str = indoc! {r#"
        version: v1.0
        name: Test
        agent:
          machine:
            type: e1-standard-2

        blocks:
          - name: ChangeIn
            run:
              when: "change_in('/lib')"
            task:
              jobs:
                - name: Hello
                  commands:
                    - echo "Hello World"
    "#};

    fn compiled(when: &str) -> serde_yaml::Value {
        let mut expected: serde_yaml::Value = serde_yaml::from_str(PIPELINE).unwrap();
        expected["blocks"][0]["run"]["when"] = when.into();
        expected
    }

    fn args(repo: &Sandbox, out: &TempDir, ref_type: RefType) -> CompileArgs {
        CompileArgs {
            input: repo.path().join(".semaphore/semaphore.yml"),
            output: out.path().join("output.yml"),
            logs: out.path().join("logs.yml"),
            repository: None,
            sha: Some(repo.rev_parse("HEAD")),
            ref_type,
            branch: None,
            pr_branch: None,
            git_depth: None,
            no_fetch: false,
            deepen_step: 50,
            max_deepen_attempts: 5,
            git_timeout: 120,
            git_binary: PathBuf::from("git"),
            remote: "origin".to_owned(),
        }
    }

    fn output(out: &TempDir) -> serde_yaml::Value {
        serde_yaml::from_str(&fs::read_to_string(out.path().join("output.yml")).unwrap())
            .unwrap()
    }

    fn logs(out: &TempDir) -> Vec<LogEntry> {
        let log: CompilationLog =
            serde_yaml::from_str(&fs::read_to_string(out.path().join("logs.yml")).unwrap())
                .unwrap();
        log.entries().to_vec()
    }

    /// `enterprise` cherry-picks everything `master` did to `lib/` and then
    /// records `master` as merged with the `ours` strategy. The pull request
    /// therefore changes nothing, although its graph is full of `lib/` commits.
    fn ours_merge(commits: usize) -> Sandbox {
        let origin = Sandbox::new();
        origin.add_file(".semaphore/semaphore.yml", PIPELINE);
        origin.commit("Bootstrap");
        origin.add_file("lib/base.txt", "base");
        origin.commit("Base change on master");
        origin.run(&["branch", "enterprise"]);
        for index in 0..commits {
            origin.add_file(
                format!("lib/master_history_{index}.txt"),
                &format!("master {index}"),
            );
            origin.commit(&format!("Master history {index}"));
        }
        origin.switch_branch("enterprise");
        // Picked later so the copies are new commits rather than master's own.
        let later = "2020-01-02T00:00:00Z";
        origin.run_dated(later, &["cherry-pick", &format!("master~{commits}..master")]);
        origin.run_dated(later, &["merge", "master", "--strategy", "ours", "--no-edit"]);
        let merge = origin.run(&["rev-list", "--parents", "-n", "1", "enterprise"]);
        assert_eq!(merge.split_whitespace().count(), 3, "not a merge commit: {merge}");
        origin
    }

    #[test]
    fn test_shallow_ours_merge_pull_request() {
        let origin = ours_merge(200);
        let repo = origin.clone_local_copy("enterprise", 1);
        repo.run(&["checkout", "--quiet", "--detach"]);

        let out = tempfile::tempdir().unwrap();
        run(CompileArgs {
            branch: Some("master".into()),
            pr_branch: Some("enterprise".into()),
            ..args(&repo, &out, RefType::PullRequest)
        })
        .unwrap();

        assert_eq!(output(&out), compiled("false"));
        let logs = logs(&out);
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].location, "blocks[0](ChangeIn).run.when");
        assert_eq!(logs[0].path_filter, "/lib");
        assert!(!logs[0].resolved_value);
        assert!(
            logs[0].reason.starts_with("no matching changes in"),
            "{}",
            logs[0].reason
        );
    }

    #[test]
    fn test_shallow_clone_without_fetching_assumes_change() {
        let origin = ours_merge(3);
        let repo = origin.clone_local_copy("enterprise", 1);
        repo.run(&["checkout", "--quiet", "--detach"]);

        let out = tempfile::tempdir().unwrap();
        run(CompileArgs {
            branch: Some("master".into()),
            pr_branch: Some("enterprise".into()),
            no_fetch: true,
            ..args(&repo, &out, RefType::PullRequest)
        })
        .unwrap();

        assert_eq!(output(&out), compiled("true"));
        let logs = logs(&out);
        assert!(logs[0].resolved_value);
        assert!(
            logs[0].reason.starts_with("history unavailable, assuming change"),
            "{}",
            logs[0].reason
        );
    }

    #[test]
    fn test_shallow_branch_build_uses_first_parent_diff() {
        let origin = ours_merge(3);
        let repo = origin.clone_local_copy("enterprise", 1);

        let out = tempfile::tempdir().unwrap();
        run(CompileArgs {
            branch: Some("enterprise".into()),
            ..args(&repo, &out, RefType::Branch)
        })
        .unwrap();

        // The merge commit's first parent already has every file.
        assert_eq!(output(&out), compiled("false"));
    }

    #[test]
    fn test_filters_match_directories() {
        let repo = Sandbox::new();
        repo.add_file(
            ".semaphore/semaphore.yml",
            indoc! {r#"
                blocks:
                  - name: Lib
                    run:
                      when: "change_in('/lib')"
                  - name: Liberty
                    run:
                      when: "change_in('../liberty/')"
            "#},
        );
        repo.add_file("lib/base.txt", "base");
        repo.commit("Bootstrap");
        repo.add_file("liberty/file.txt", "liberty");
        repo.commit("Liberty");

        let out = tempfile::tempdir().unwrap();
        run(CompileArgs {
            branch: Some("master".into()),
            ..args(&repo, &out, RefType::Branch)
        })
        .unwrap();

        let output = output(&out);
        assert_eq!(output["blocks"][0]["run"]["when"], "false");
        assert_eq!(output["blocks"][1]["run"]["when"], "true");
        assert_eq!(logs(&out).len(), 2);
    }

    #[test]
    fn test_missing_git_binary_is_fatal() {
        let origin = Sandbox::new();
        origin.add_file(".semaphore/semaphore.yml", PIPELINE);
        origin.commit("Bootstrap");
        origin.add_file("lib/base.txt", "base");
        origin.commit("Base change on master");
        let repo = origin.clone_local_copy("master", 1);

        let out = tempfile::tempdir().unwrap();
        let error = run(CompileArgs {
            branch: Some("master".into()),
            git_binary: PathBuf::from("/nonexistent/git"),
            ..args(&repo, &out, RefType::Branch)
        })
        .unwrap_err();

        let Error::Evaluation {
            location, source, ..
        } = error
        else {
            panic!("expected an evaluation error");
        };
        assert_eq!(location, "blocks[0](ChangeIn).run.when");
        assert!(matches!(source, HistoryError::Command { .. }), "{source}");
        assert!(!out.path().join("output.yml").exists());
        assert!(logs(&out).is_empty());
    }

    #[test]
    fn test_malformed_expression_keeps_log() {
        let repo = Sandbox::new();
        repo.add_file(
            ".semaphore/semaphore.yml",
            indoc! {r#"
                blocks:
                  - name: Fine
                    run:
                      when: "change_in('/lib')"
                  - name: Broken
                    run:
                      when: "change_in('/lib', {branch: 'main'})"
            "#},
        );
        repo.commit("Bootstrap");
        repo.add_file("lib/base.txt", "base");
        repo.commit("Lib");

        let out = tempfile::tempdir().unwrap();
        let error = run(args(&repo, &out, RefType::Branch)).unwrap_err();
        assert_eq!(
            error.to_string(),
            "blocks[1](Broken).run.when: malformed change_in expression: unknown option \"branch\""
        );
        let logs = logs(&out);
        assert_eq!(logs.len(), 1);
        assert!(logs[0].resolved_value);
    }

    #[test]
    fn test_unreadable_input() {
        let repo = Sandbox::new();
        repo.commit("Empty");
        let out = tempfile::tempdir().unwrap();
        let error = run(CompileArgs {
            sha: None,
            ..args(&repo, &out, RefType::Branch)
        })
        .unwrap_err();
        assert!(matches!(error, Error::Read { .. }));
        assert!(logs(&out).is_empty());
    }

    #[test]
    fn test_pipeline_dir() {
        let repo = Sandbox::new();
        let input = repo.add_file(".semaphore/semaphore.yml", PIPELINE);
        assert_eq!(pipeline_dir(&input, repo.path()), Path::new(".semaphore"));
        assert_eq!(
            pipeline_dir(&repo.add_file("root.yml", PIPELINE), repo.path()),
            Path::new("")
        );
        assert_eq!(pipeline_parent(Path::new("semaphore.yml")), Path::new("."));
    }

    #[test]
    fn test_cli() {
        let cli = Cli::try_parse_from([
            "change-in",
            "compile",
            "--input",
            "in.yml",
            "--output",
            "out.yml",
            "--logs",
            "logs.yml",
            "--ref-type",
            "pull-request",
            "--branch",
            "master",
        ])
        .unwrap();
        let Command::Compile(args) = cli.command;
        assert_eq!(args.ref_type, RefType::PullRequest);
        assert_eq!(args.branch.as_deref(), Some("master"));
        assert_eq!(args.deepen_step, 50);
        assert_eq!(args.git_binary, PathBuf::from("git"));
        assert!(Cli::try_parse_from(["change-in", "compile", "--ref-type", "merge"]).is_err());
    }
}

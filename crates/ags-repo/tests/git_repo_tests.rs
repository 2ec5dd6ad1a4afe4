use ags_repo::test_helpers::{create_git_repo, git_available, GitRepoConfig};
use ags_repo::{GitRepo, VcsError};

#[tokio::test]
async fn clone_creates_independent_working_copy() {
    if !git_available() {
        println!("Skipping Git test: git command not available");
        return;
    }

    let project = create_git_repo(Some(GitRepoConfig::new().file("app.py", "print('x')\n")))
        .await
        .unwrap();
    let target = tempfile::tempdir().unwrap();
    let dest = target.path().join("worktrees").join("session-1");

    let clone = GitRepo::clone_from(&project.path, &dest).unwrap();

    assert_eq!(clone.root(), dest.as_path());
    assert!(dest.join("app.py").exists());

    std::fs::write(dest.join("app.py"), "print('changed')\n").unwrap();
    let original = std::fs::read_to_string(project.path.join("app.py")).unwrap();
    assert_eq!(original, "print('x')\n");
}

#[tokio::test]
async fn clone_failure_reports_stderr() {
    if !git_available() {
        println!("Skipping Git test: git command not available");
        return;
    }

    let target = tempfile::tempdir().unwrap();
    let missing = target.path().join("does-not-exist");

    let err = GitRepo::clone_from(&missing, target.path().join("dest")).unwrap_err();

    match err {
        VcsError::CommandFailed { exit_code, ref stderr, .. } => {
            assert_ne!(exit_code, 0);
            assert!(!stderr.is_empty());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.stderr().is_some());
}

#[tokio::test]
async fn staged_diff_is_empty_without_changes() {
    if !git_available() {
        println!("Skipping Git test: git command not available");
        return;
    }

    let project = create_git_repo(None).await.unwrap();
    let repo = GitRepo::open(&project.path).unwrap();

    repo.stage_all().unwrap();

    assert_eq!(repo.staged_diff().unwrap(), "");
}

#[tokio::test]
async fn stage_all_includes_untracked_and_deleted_files() {
    if !git_available() {
        println!("Skipping Git test: git command not available");
        return;
    }

    let project = create_git_repo(None).await.unwrap();
    let repo = GitRepo::open(project.path.join(".")).unwrap();
    std::fs::write(project.path.join("hello.py"), "def hello():\n    return 'hi'\n").unwrap();
    std::fs::remove_file(project.path.join("README.md")).unwrap();

    repo.stage_all().unwrap();
    let diff = repo.staged_diff().unwrap();

    assert!(diff.contains("hello.py"));
    assert!(diff.contains("deleted file mode"));
    // staging again changes nothing
    repo.stage_all().unwrap();
    assert_eq!(repo.staged_diff().unwrap(), diff);
}

#[tokio::test]
async fn stage_pathspec_limits_the_diff() {
    if !git_available() {
        println!("Skipping Git test: git command not available");
        return;
    }

    let project = create_git_repo(None).await.unwrap();
    let repo = GitRepo::open(&project.path).unwrap();
    std::fs::write(project.path.join("keep.txt"), "keep\n").unwrap();
    std::fs::write(project.path.join("skip.txt"), "skip\n").unwrap();

    repo.stage_pathspec("keep.txt").unwrap();
    let diff = repo.staged_diff().unwrap();

    assert!(diff.contains("keep.txt"));
    assert!(!diff.contains("skip.txt"));
    assert!(repo.stage_pathspec("nothing-*.md").is_err());
}

#[tokio::test]
async fn apply_patch_reproduces_changes_in_another_checkout() {
    if !git_available() {
        println!("Skipping Git test: git command not available");
        return;
    }

    let project = create_git_repo(None).await.unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let workspace = GitRepo::clone_from(&project.path, scratch.path().join("ws")).unwrap();
    std::fs::write(workspace.root().join("hello.py"), "print('hello')\n").unwrap();
    workspace.stage_all().unwrap();
    let patch = workspace.staged_diff().unwrap();

    let target = GitRepo::open(&project.path).unwrap();
    target.apply_patch(&patch).unwrap();

    let applied = std::fs::read_to_string(project.path.join("hello.py")).unwrap();
    assert_eq!(applied, "print('hello')\n");
    assert!(target.status_porcelain().unwrap().contains("hello.py"));
}

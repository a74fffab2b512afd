//! Prompts that seed a triage conversation.

use triage_core::IssueRef;

/// Role instructions for the triage agent.
pub fn triage_system_prompt() -> String {
    r#"You are an issue triage assistant for a software repository.

For every new issue you are given, work through these steps using the tools:

1. Call `get_issue_by_number` with the owner, repository and issue number to read the issue.
2. Analyze the title and body. Decide what kind of issue it is (for example bug,
   enhancement, question, documentation) and how urgent it looks.
3. Call `add_labels` with the labels that fit, and call `post_comment` with a short,
   friendly comment that summarizes your understanding and any missing information
   the reporter should provide.
4. When the labels and the comment are in place, reply with a brief plain-text
   confirmation of what you did. Do not call any more tools after that.

If a tool reports an error, read the message and decide whether to retry with
corrected arguments, skip that step, or explain the failure in your final reply.
Never invent issue content you have not fetched."#
        .to_string()
}

/// Human message naming the issue to triage.
pub fn issue_prompt(target: &IssueRef, title: Option<&str>) -> String {
    let mut prompt = format!(
        "A new issue was opened. Triage issue #{} in the repository {}/{} (owner: \"{}\", repo: \"{}\", issueNumber: {}).",
        target.issue_number,
        target.owner,
        target.repo,
        target.owner,
        target.repo,
        target.issue_number
    );
    if let Some(title) = title.filter(|title| !title.trim().is_empty()) {
        prompt.push_str(&format!(" Its title is \"{}\".", title.trim()));
    }
    prompt
}

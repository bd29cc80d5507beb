//! Lane instruction templates.
//!
//! Each lane transition dispatches one of these prompts to the lane's
//! session after the card state has committed. The prompts tell the agent
//! which machine-tagged block to emit so the artifact sync job can harvest
//! the result later.

use super::models::Card;

/// Instruction for a planning session: produce a PRD and an issue plan.
pub fn plan_prompt(card: &Card) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!(
        "# Planning: {}\n\nYou are planning the following work item.\n\n",
        card.title
    ));
    prompt.push_str("## Card\n\n");
    prompt.push_str(&card.body);
    prompt.push_str("\n\n");
    if let Some(prd_path) = &card.prd_path {
        prompt.push_str(&format!(
            "## PRD\n\nWrite the product requirements document to `{}`.\n\n",
            prd_path
        ));
    }
    prompt.push_str(
        "## Output\n\n\
         When the plan is ready, emit it as a single machine-readable block:\n\n\
         <issue-plan>\n\
         {\"issues\": [{\"title\": \"...\", \"body\": \"...\", \"labels\": [\"...\"]}]}\n\
         </issue-plan>\n\n\
         Every issue needs a title; bodies and labels are optional.\n",
    );
    prompt
}

/// Instruction for a build session: implement the card inside its worktree.
pub fn build_prompt(card: &Card) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!(
        "# Build: {}\n\nImplement the following work item.\n\n",
        card.title
    ));
    prompt.push_str("## Card\n\n");
    prompt.push_str(&card.body);
    prompt.push_str("\n\n## Environment\n\n");
    if let Some(path) = &card.build_worktree_path {
        prompt.push_str(&format!("- Worktree: `{}`\n", path));
    }
    if let Some(branch) = &card.build_branch {
        prompt.push_str(&format!("- Branch: `{}`\n", branch));
    }
    if let Some(base) = &card.base_branch {
        prompt.push_str(&format!("- Base branch: `{}`\n", base));
    }
    if let Some(prd_path) = &card.prd_path {
        prompt.push_str(&format!("- PRD: `{}`\n", prd_path));
    }
    prompt.push_str(
        "\n## Output\n\n\
         Commit your work on the branch and open a pull request against the \
         base branch. When finished, report the result:\n\n\
         <build-result>\n\
         {\"pr_url\": \"https://...\", \"summary\": \"what was done\"}\n\
         </build-result>\n",
    );
    prompt
}

/// Instruction for a review session: assess the build and emit a review.
pub fn review_prompt(card: &Card) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!(
        "# Review: {}\n\nReview the implementation of this work item.\n\n",
        card.title
    ));
    prompt.push_str("## Card\n\n");
    prompt.push_str(&card.body);
    prompt.push_str("\n\n## Scope\n\n");
    if let Some(pr_url) = &card.pr_url {
        prompt.push_str(&format!("- Pull request: {}\n", pr_url));
    }
    if let Some(branch) = &card.build_branch {
        prompt.push_str(&format!("- Branch: `{}`\n", branch));
    }
    if let Some(base) = &card.base_branch {
        prompt.push_str(&format!("- Base branch: `{}`\n", base));
    }
    prompt.push_str(
        "\n## Output\n\n\
         Emit your structured review when done:\n\n\
         <ai-review>\n\
         {\"verdict\": \"approve|request_changes\", \"summary\": \"...\", \"findings\": []}\n\
         </ai-review>\n\n\
         A human makes the final call; your review informs it.\n",
    );
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::models::{HumanReviewStatus, Lane};

    fn card() -> Card {
        Card {
            id: 7,
            project_id: 1,
            squad_id: 1,
            lane: Lane::Plan,
            position: 0,
            title: "Fix login bug".into(),
            body: "Fix login bug\n\nUsers get a 500 on bad passwords.".into(),
            prd_path: Some("docs/prds/003-fix-login-bug.md".into()),
            issue_plan: None,
            issue_refs: None,
            pr_url: Some("https://github.com/acme/demo/pull/9".into()),
            pr_opened_at: None,
            plan_agent_id: None,
            plan_session_id: None,
            build_agent_id: None,
            build_session_id: None,
            review_agent_id: None,
            review_session_id: None,
            build_worktree_name: None,
            build_worktree_path: Some("/repo/.worktrees/builder-7".into()),
            build_branch: Some("squads/builder-7".into()),
            base_branch: Some("main".into()),
            ai_review: None,
            ai_review_session_id: None,
            human_review_status: HumanReviewStatus::Pending,
            human_review_feedback: None,
            human_reviewed_at: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn test_plan_prompt_mentions_prd_and_tag() {
        let prompt = plan_prompt(&card());
        assert!(prompt.contains("docs/prds/003-fix-login-bug.md"));
        assert!(prompt.contains("<issue-plan>"));
    }

    #[test]
    fn test_build_prompt_carries_worktree_context() {
        let prompt = build_prompt(&card());
        assert!(prompt.contains("/repo/.worktrees/builder-7"));
        assert!(prompt.contains("squads/builder-7"));
        assert!(prompt.contains("<build-result>"));
    }

    #[test]
    fn test_review_prompt_points_at_pr() {
        let prompt = review_prompt(&card());
        assert!(prompt.contains("https://github.com/acme/demo/pull/9"));
        assert!(prompt.contains("<ai-review>"));
    }
}

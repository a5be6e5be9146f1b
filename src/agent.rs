//! Tutor agents. Only the canned stub exists today; the trait is the seam a
//! model-backed provider would plug into.

use std::collections::HashMap;

use chrono::NaiveDateTime;
use sha2::{Digest, Sha256};

pub const KIND_HOME: &str = "home";
pub const KIND_SEMESTER: &str = "semester";
pub const KIND_COURSE: &str = "course";
pub const KIND_GENERIC: &str = "generic";

/// Data an agent may draw on. Built by the handler from the workspace so the
/// agent itself never touches the database.
#[derive(Debug, Clone, Default)]
pub enum AgentContext {
    #[default]
    None,
    Semester(SemesterContext),
    Course(CourseContext),
}

#[derive(Debug, Clone, Default)]
pub struct SemesterContext {
    pub course_names: Vec<String>,
    pub upcoming: Vec<(String, NaiveDateTime)>,
}

#[derive(Debug, Clone, Default)]
pub struct CourseContext {
    /// (title, kind)
    pub materials: Vec<(String, String)>,
    pub pending_tasks: Vec<(String, Option<NaiveDateTime>)>,
    pub upcoming: Vec<(String, NaiveDateTime)>,
}

pub trait Agent: Send {
    fn kind(&self) -> &str;
    fn respond(&self, question: &str, ctx: &AgentContext, now: NaiveDateTime) -> String;
}

pub struct StubAgent {
    kind: &'static str,
    replies: &'static [&'static str],
}

const HOME_REPLIES: &[&str] = &[
    "Hi! I'm your study assistant. Full chat features are coming soon!",
    "Welcome to your study assistant! For now, use the agenda and course features.",
    "Hello! I'm still in development, but I can already help you find your way around.",
];

const SEMESTER_REPLIES: &[&str] = &[
    "About this semester, I can help with course information and the agenda.",
    "This semester has plenty going on! Want to know more about a specific course?",
    "I can give you information about the courses and events of this semester.",
];

const COURSE_REPLIES: &[&str] = &[
    "As the tutor for this course, I can help with the available materials and schedule.",
    "I have access to this course's study materials. How can I help?",
    "I can explain concepts based on the materials you uploaded.",
];

const GENERIC_REPLIES: &[&str] =
    &["I'm an assistant in development. More features coming soon!"];

pub fn normalize_kind(raw: &str) -> &'static str {
    match raw.trim().to_ascii_lowercase().as_str() {
        KIND_HOME => KIND_HOME,
        KIND_SEMESTER => KIND_SEMESTER,
        KIND_COURSE => KIND_COURSE,
        _ => KIND_GENERIC,
    }
}

impl StubAgent {
    pub fn new(kind: &str) -> Self {
        let kind = normalize_kind(kind);
        let replies = match kind {
            KIND_HOME => HOME_REPLIES,
            KIND_SEMESTER => SEMESTER_REPLIES,
            KIND_COURSE => COURSE_REPLIES,
            _ => GENERIC_REPLIES,
        };
        Self { kind, replies }
    }

    fn base_reply(&self, question: &str) -> &'static str {
        let digest = Sha256::digest(question.trim().as_bytes());
        let mut first = [0u8; 8];
        first.copy_from_slice(&digest[..8]);
        let idx = (u64::from_be_bytes(first) % self.replies.len() as u64) as usize;
        self.replies[idx]
    }

    fn context_block(&self, ctx: &AgentContext) -> Option<String> {
        match (self.kind, ctx) {
            (KIND_SEMESTER, AgentContext::Semester(s)) => Some(semester_block(s)),
            (KIND_COURSE, AgentContext::Course(c)) => Some(course_block(c)),
            _ => None,
        }
    }
}

fn semester_block(s: &SemesterContext) -> String {
    let mut lines = Vec::new();
    if !s.course_names.is_empty() {
        let shown: Vec<&str> = s.course_names.iter().take(3).map(String::as_str).collect();
        lines.push(format!("Courses this semester: {}", shown.join(", ")));
        if s.course_names.len() > 3 {
            lines.push(format!("(and {} more courses)", s.course_names.len() - 3));
        }
    }
    if !s.upcoming.is_empty() {
        lines.push("Upcoming events:".to_string());
        for (title, at) in s.upcoming.iter().take(3) {
            lines.push(format!("- {} ({})", title, at.format("%d/%m")));
        }
    }
    if lines.is_empty() {
        return "No specific information is available right now.".to_string();
    }
    lines.join("\n")
}

fn course_block(c: &CourseContext) -> String {
    let mut lines = Vec::new();
    if !c.materials.is_empty() {
        lines.push("Available materials:".to_string());
        for (title, kind) in c.materials.iter().take(5) {
            lines.push(format!("- {title} ({kind})"));
        }
    }
    if !c.pending_tasks.is_empty() {
        lines.push("\nPending tasks:".to_string());
        for (title, deadline) in c.pending_tasks.iter().take(3) {
            let due = deadline
                .map(|d| d.format("%d/%m").to_string())
                .unwrap_or_else(|| "no deadline".to_string());
            lines.push(format!("- {title} ({due})"));
        }
    }
    if !c.upcoming.is_empty() {
        lines.push("\nUpcoming events:".to_string());
        for (title, at) in c.upcoming.iter().take(2) {
            lines.push(format!("- {} ({})", title, at.format("%d/%m at %H:%M")));
        }
    }
    if lines.is_empty() {
        return "This course has no materials or activities yet.".to_string();
    }
    lines.join("\n")
}

impl Agent for StubAgent {
    fn kind(&self) -> &str {
        self.kind
    }

    fn respond(&self, question: &str, ctx: &AgentContext, now: NaiveDateTime) -> String {
        let mut reply = self.base_reply(question).to_string();
        if let Some(block) = self.context_block(ctx) {
            reply.push_str("\n\n");
            reply.push_str(&block);
        }
        reply.push_str(&format!(
            "\n\n---\nSimulated AI ({}) - {}",
            self.kind,
            now.format("%d/%m/%Y at %H:%M")
        ));
        reply
    }
}

/// One agent per kind, created on first use.
#[derive(Default)]
pub struct AgentCache {
    agents: HashMap<&'static str, Box<dyn Agent>>,
}

impl AgentCache {
    pub fn get(&mut self, kind: &str) -> &dyn Agent {
        let kind = normalize_kind(kind);
        &**self.agents.entry(kind).or_insert_with(|| {
            log::debug!("agent cache miss kind={kind}");
            Box::new(StubAgent::new(kind))
        })
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.agents.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::parse_date_time;

    fn now() -> NaiveDateTime {
        parse_date_time("2026-10-16T08:05").expect("dt")
    }

    #[test]
    fn same_question_same_reply() {
        let agent = StubAgent::new("home");
        let a = agent.respond("what's next?", &AgentContext::None, now());
        let b = agent.respond("what's next?", &AgentContext::None, now());
        assert_eq!(a, b);
        assert!(a.ends_with("---\nSimulated AI (home) - 16/10/2026 at 08:05"));
        assert!(HOME_REPLIES.iter().any(|r| a.starts_with(r)));
    }

    #[test]
    fn unknown_kinds_fall_back_to_generic() {
        let agent = StubAgent::new("planner");
        assert_eq!(agent.kind(), KIND_GENERIC);
        let reply = agent.respond("hi", &AgentContext::None, now());
        assert!(reply.starts_with(GENERIC_REPLIES[0]));
    }

    #[test]
    fn semester_context_lists_three_courses_and_the_rest() {
        let ctx = AgentContext::Semester(SemesterContext {
            course_names: vec!["A".into(), "B".into(), "C".into(), "D".into(), "E".into()],
            upcoming: vec![("Exam".into(), parse_date_time("2026-10-20T10:00").expect("dt"))],
        });
        let reply = StubAgent::new("semester").respond("q", &ctx, now());
        assert!(reply.contains("Courses this semester: A, B, C"));
        assert!(reply.contains("(and 2 more courses)"));
        assert!(reply.contains("- Exam (20/10)"));
    }

    #[test]
    fn course_context_and_empty_course() {
        let ctx = AgentContext::Course(CourseContext {
            materials: vec![("Notes".into(), "PDF".into())],
            pending_tasks: vec![("List 1".into(), None)],
            upcoming: vec![("Quiz".into(), parse_date_time("2026-10-21T14:30").expect("dt"))],
        });
        let reply = StubAgent::new("course").respond("q", &ctx, now());
        assert!(reply.contains("- Notes (PDF)"));
        assert!(reply.contains("- List 1 (no deadline)"));
        assert!(reply.contains("- Quiz (21/10 at 14:30)"));

        let empty = StubAgent::new("course").respond(
            "q",
            &AgentContext::Course(CourseContext::default()),
            now(),
        );
        assert!(empty.contains("This course has no materials or activities yet."));
    }

    #[test]
    fn cache_reuses_agents_per_kind() {
        let mut cache = AgentCache::default();
        assert_eq!(cache.get("semester").kind(), KIND_SEMESTER);
        assert_eq!(cache.get("SEMESTER").kind(), KIND_SEMESTER);
        assert_eq!(cache.get("whatever").kind(), KIND_GENERIC);
        assert_eq!(cache.len(), 2);
    }
}

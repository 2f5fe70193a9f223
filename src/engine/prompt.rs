//! Prompt composition for the oracle

use rand::seq::SliceRandom;
use rand::Rng;
use std::fmt::Write as _;

use crate::config::AgentProfile;
use crate::domain::{AgentId, AgentSummary, MessageRecord, RoomContext, RoundId, RoundStatus};

const SAMPLE_SIZE: usize = 3;

/// Snapshot of everything a prompt needs, captured under the state lock so
/// the oracle call can run without it.
#[derive(Debug, Clone)]
pub struct PromptContext {
    pub agent_id: AgentId,
    pub profile: AgentProfile,
    pub topic: String,
    pub round_id: RoundId,
    pub round_status: Option<RoundStatus>,
    pub others: Vec<AgentSummary>,
    pub recent_messages: Vec<MessageRecord>,
    pub recent_observations: Vec<String>,
}

impl PromptContext {
    /// Capture the last `window` messages and observations of `round_id`.
    /// An untracked round yields an empty history.
    pub fn capture(
        ctx: &RoomContext,
        round_id: RoundId,
        agent_id: AgentId,
        profile: &AgentProfile,
        window: usize,
    ) -> Self {
        let round = ctx.rounds.get(round_id);
        Self {
            agent_id,
            profile: profile.clone(),
            topic: ctx.topic.label(),
            round_id,
            round_status: round.map(|r| r.status),
            others: round
                .map(|r| {
                    r.agents
                        .values()
                        .filter(|a| a.id != agent_id)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default(),
            recent_messages: round
                .map(|r| r.messages.last(window).cloned().collect())
                .unwrap_or_default(),
            recent_observations: round
                .map(|r| r.observations.last(window).cloned().collect())
                .unwrap_or_default(),
        }
    }

    fn name(&self) -> &str {
        &self.profile.name
    }

    fn roster(&self) -> String {
        if self.others.is_empty() {
            return "(none)".to_string();
        }
        self.others
            .iter()
            .map(|a| match &a.single_sentence_summary {
                Some(summary) => format!("- {} ({}): {}", a.display_name, a.id, summary),
                None => format!("- {} ({})", a.display_name, a.id),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn messages(&self) -> String {
        if self.recent_messages.is_empty() {
            return "(no messages yet)".to_string();
        }
        self.recent_messages
            .iter()
            .map(|m| format!("[{}] {}", m.agent_name, m.text))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn observations(&self) -> String {
        if self.recent_observations.is_empty() {
            return "(no observations yet)".to_string();
        }
        self.recent_observations.join("\n")
    }
}

/// Random subset of at most three entries
pub fn sample_lines<R: Rng + ?Sized>(items: &[String], rng: &mut R) -> Vec<String> {
    items
        .choose_multiple(rng, SAMPLE_SIZE.min(items.len()))
        .cloned()
        .collect()
}

fn bulleted(items: &[String]) -> String {
    items
        .iter()
        .map(|i| format!("- {}", i))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn should_respond_prompt(ctx: &PromptContext) -> String {
    let name = ctx.name();
    let profile = &ctx.profile;
    let mut prompt = String::new();

    let _ = writeln!(
        prompt,
        "# Task: Determine if {name} should participate in the crypto investment discussion.\n"
    );
    let _ = writeln!(
        prompt,
        "# Overall topic:\nShould I buy, sell, or hold {}? The discussion you are having informs this decision.\n",
        ctx.topic
    );
    let _ = writeln!(prompt, "About {name}:\n\nKnowledge/Expertise:\n{}\n", bulleted(&profile.knowledge));
    let _ = writeln!(prompt, "Other agents in the room:\n{}\n", ctx.roster());
    let _ = writeln!(
        prompt,
        "Investment Approach:\n- Style: {}\n- Risk: {}\n- Experience: {}\n",
        profile.investment_style, profile.risk_tolerance, profile.experience_level
    );
    let _ = writeln!(prompt, "Recent Messages:\n{}\n", ctx.messages());
    let _ = writeln!(prompt, "Recent Observations:\n{}\n", ctx.observations());
    let _ = writeln!(
        prompt,
        "RESPOND when directly addressed (@{name}), when the discussion touches {name}'s expertise, \
         when new information affects the investment thesis, or when the discussion approaches a decision.\n\
         IGNORE when the conversation is between others, the point was already addressed, or there is nothing new to add.\n\
         STOP when the final decision has been made or {name} was asked to stop.\n\
         If it's a close call, respond with [RESPOND].\n"
    );
    let _ = write!(
        prompt,
        "The available options are [RESPOND], [IGNORE], or [STOP]. Choose the most appropriate option. \
         If {name} is talking too much, you can choose [IGNORE].\n\
         Your response should be formatted as a JSON block like this:\n\
         ```json\n{{ \"reasoning\": <explanation of your choice>, \"action\": <\"[RESPOND]\" | \"[IGNORE]\" | \"[STOP]\"> }}\n```\n"
    );
    prompt
}

pub fn completion_prompt<R: Rng + ?Sized>(ctx: &PromptContext, rng: &mut R) -> String {
    let name = ctx.name();
    let profile = &ctx.profile;
    let weights = profile.weights;
    let random_number: u8 = rng.gen_range(1..=10);
    let mut prompt = String::new();

    let _ = writeln!(
        prompt,
        "# Overall topic:\nShould I buy, sell, or hold {}? The discussion you are having informs this decision.\n",
        ctx.topic
    );
    let _ = writeln!(
        prompt,
        "This is a random number between 1 and 10. If this number is 2, 3 or 4, consider including the token symbol in your response: {random_number}\n\
         Do not mention this number in your response.\n"
    );
    let _ = writeln!(prompt, "# Character: {name}\n{}\n", profile.bio.join(" "));
    let _ = writeln!(prompt, "Knowledge:\n{}\n", bulleted(&profile.knowledge));
    let _ = writeln!(prompt, "Lore:\n{}\n", bulleted(&sample_lines(&profile.lore, rng)));
    let _ = writeln!(
        prompt,
        "Example messages:\n{}\n",
        bulleted(&sample_lines(&profile.message_examples, rng))
    );
    let _ = writeln!(
        prompt,
        "Investment Profile:\n- Style: {}\n- Risk: {}\n- Experience: {}\n",
        profile.investment_style, profile.risk_tolerance, profile.experience_level
    );
    let _ = writeln!(
        prompt,
        "# DECISION WEIGHT\n- Technical Analysis: {}\n- Fundamental Analysis: {}\n- Market Sentiment: {}\n- Risk Assessment: {}\n",
        weights.technical, weights.fundamental, weights.sentiment, weights.risk
    );
    let _ = writeln!(
        prompt,
        "These are the other agents in the room. Mention them (<@NAME>) if you are responding to something they said.\n{}\n",
        ctx.roster()
    );
    let _ = writeln!(prompt, "Recent Messages:\n{}\n", ctx.messages());
    let _ = writeln!(prompt, "Onchain Metrics:\n{}\n", ctx.observations());
    let _ = write!(
        prompt,
        "# Instructions\nGenerate a brief response as {name} that advances the discussion toward buy/hold/sell, \
         uses the data above and mentions back anyone who mentioned you. Keep it under 500 characters.\n"
    );
    prompt
}

pub fn decision_prompt(ctx: &PromptContext) -> String {
    let status = ctx
        .round_status
        .map(|s| s.as_str())
        .unwrap_or(RoundStatus::None.as_str());
    format!(
        "Based on the discussion up to this point and the recent context below, should we BUY, HOLD, or SELL {topic}?\n\n\
         Round {round} ({status})\n\n\
         Recent Messages:\n{messages}\n\n\
         Observations:\n{observations}\n\n\
         You must make a decision right now. This is a fictional transaction.\n\
         Respond with only one of BUY, HOLD or SELL and nothing else.\n\
         If you are not sure, pick one anyway.\n",
        topic = ctx.topic,
        round = ctx.round_id,
        messages = ctx.messages(),
        observations = ctx.observations(),
    )
}

pub fn announce_prompt(ctx: &PromptContext) -> String {
    let name = ctx.name();
    format!(
        "You have just joined the discussion. You are {name}. Your ID is: {id}.\n\
         The topic of the discussion is {topic}. You are going to engage in a discussion with the other agents \
         to decide if you should buy, sell, or hold {topic}.\n\n\
         Recent Messages:\n{messages}\n\n\
         Your expertise:\n{knowledge}\n\n\
         The other agents in the room are:\n{roster}\n\n\
         If any message mentions you or touches your expertise, respond by mentioning the agent who posted it.\n\
         Now announce to the other agents in the room that you are here and ready to start the discussion.\n",
        id = ctx.agent_id,
        topic = ctx.topic,
        messages = ctx.messages(),
        knowledge = bulleted(&ctx.profile.knowledge),
        roster = ctx.roster(),
    )
}

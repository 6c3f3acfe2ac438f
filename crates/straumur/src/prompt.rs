//! Prompt templates for question answering.

use serde::{Deserialize, Serialize};

const PLAIN_STOPS: &[&str] = &["\nQuestion:", "\nQ", "\nB", "\nC", "\nD"];

const MARKDOWN_STOPS: &[&str] = &[
    "==END==",
    "\n==END==",
    "\n==END==\n",
    "\n==END\n",
    "\n==END",
    "\n==",
];

/// How a question is framed for the model, and the strings that end its answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptTemplate {
    /// `Q: ...\nA:` completion. Stops when the model starts a new question or option.
    Plain,
    /// Asks for markdown with katex math and an explicit `==END==` line.
    #[default]
    Markdown,
}

impl PromptTemplate {
    pub fn render(&self, question: &str) -> String {
        match self {
            PromptTemplate::Plain => format!("Q: {question}\nA:"),
            PromptTemplate::Markdown => format!(
                "Answer the question using markdown formatting and katex for math.\n\
                 After providing your complete answer, conclude your response by adding \n\
                 ==END==\n as the final line, with no text following it. \n\n\
                 Q: {question}\n\nA:"
            ),
        }
    }

    pub fn stop_strings(&self) -> &'static [&'static str] {
        match self {
            PromptTemplate::Plain => PLAIN_STOPS,
            PromptTemplate::Markdown => MARKDOWN_STOPS,
        }
    }
}

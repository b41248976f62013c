//! Sales playbook generation
//!
//! Builds objections, value propositions and a call outline from the
//! product, the prospect's company and the buyer persona. Purely keyword
//! driven; the result can be printed or spoken by the coach.

use serde::Serialize;

/// At most this many value propositions are returned
const MAX_VALUE_PROPS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Objection {
    pub objection: String,
    pub response: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Playbook {
    pub product: String,
    pub objections: Vec<Objection>,
    pub value_props: Vec<String>,
    pub script: Vec<String>,
}

impl Playbook {
    pub fn generate(product: &str, company: &str, persona: &str) -> Self {
        Self {
            product: product.trim().to_string(),
            objections: generate_objections(product, company, persona),
            value_props: generate_value_props(product),
            script: generate_sales_script(company, persona),
        }
    }

    /// Short text for the coach to read aloud
    pub fn spoken_summary(&self) -> String {
        let mut parts = Vec::new();
        if !self.value_props.is_empty() {
            parts.push(format!(
                "Lead with value. {}.",
                self.value_props.join(". ")
            ));
        }
        if let Some(first) = self.objections.first() {
            parts.push(format!(
                "Expect to hear: {}. {}.",
                first.objection,
                first.response.trim_start_matches("Response: ")
            ));
        }
        if let Some(last) = self.script.last() {
            parts.push(format!("Finish with {}.", last.to_lowercase()));
        }
        parts.join(" ")
    }
}

impl std::fmt::Display for Playbook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.product.is_empty() {
            writeln!(f, "Playbook: {}", self.product)?;
            writeln!(f)?;
        }

        writeln!(f, "Value propositions:")?;
        for prop in &self.value_props {
            writeln!(f, "  - {}", prop)?;
        }

        writeln!(f)?;
        writeln!(f, "Objections:")?;
        for (i, o) in self.objections.iter().enumerate() {
            writeln!(f, "  {}. \"{}\"", i + 1, o.objection)?;
            writeln!(f, "     {}", o.response)?;
        }

        writeln!(f)?;
        writeln!(f, "Call outline:")?;
        for (i, step) in self.script.iter().enumerate() {
            writeln!(f, "  {}. {}", i + 1, step)?;
        }
        Ok(())
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

pub fn generate_objections(product: &str, company: &str, persona: &str) -> Vec<Objection> {
    let product = product.to_lowercase();
    let company = company.trim();
    let persona = persona.trim().to_lowercase();

    let is_subscription = contains_any(&product, &["subscription", "saas"]);
    let is_tech = contains_any(&product, &["software", "platform", "app"]);

    let competitor = if company.is_empty() {
        "We're happy with our current solution".to_string()
    } else {
        // A multi-word company name is taken to start with the incumbent vendor
        let incumbent = match company.split_once(' ') {
            Some((first, _)) => first,
            None => "a similar solution",
        };
        format!("We already use {}", incumbent)
    };

    let mut objections = vec![
        Objection {
            objection: "It's too expensive".to_string(),
            response: if is_subscription {
                "Response: Focus on ROI and how our subscription model spreads costs over time"
            } else {
                "Response: Focus on ROI and long-term cost savings"
            }
            .to_string(),
        },
        Objection {
            objection: competitor,
            response: if is_tech {
                "Response: Highlight our platform's unique features and superior integration capabilities"
            } else {
                "Response: Highlight unique benefits and differentiation from competitors"
            }
            .to_string(),
        },
        Objection {
            objection: if is_tech {
                "We don't have IT resources to implement this"
            } else {
                "We don't have time to implement something new"
            }
            .to_string(),
            response: if is_tech {
                "Response: Emphasize our dedicated implementation team and quick technical onboarding"
            } else {
                "Response: Emphasize quick onboarding and minimal disruption to operations"
            }
            .to_string(),
        },
    ];

    if !persona.is_empty() {
        let is_manager = persona.contains("manager");
        objections.push(Objection {
            objection: format!(
                "I need to consult with {} first",
                if is_manager { "senior leadership" } else { "my team" }
            ),
            response: format!(
                "Response: Offer a collaborative demo with {} to accelerate the decision process",
                if is_manager { "their team" } else { "key stakeholders" }
            ),
        });
    }

    objections
}

pub fn generate_value_props(product: &str) -> Vec<String> {
    let product = product.to_lowercase();
    let mut props = Vec::new();

    props.push(if contains_any(&product, &["automation", "workflow"]) {
        "Increases efficiency by automating repetitive tasks"
    } else {
        "Increases efficiency by streamlining workflows"
    });

    props.push(if contains_any(&product, &["cost", "saving"]) {
        "Reduces operational costs by up to 30% through optimization"
    } else {
        "Reduces costs through automation and resource optimization"
    });

    props.push(if contains_any(&product, &["customer", "client", "service"]) {
        "Improves customer satisfaction with faster response times and better service delivery"
    } else {
        "Improves overall performance with better resource allocation"
    });

    if contains_any(&product, &["data", "analytics"]) {
        props.push("Provides actionable insights through advanced analytics");
    }

    if contains_any(&product, &["compliance", "security"]) {
        props.push("Ensures regulatory compliance and enhances security measures");
    }

    props
        .into_iter()
        .take(MAX_VALUE_PROPS)
        .map(str::to_string)
        .collect()
}

pub fn generate_sales_script(company: &str, persona: &str) -> Vec<String> {
    let company = company.trim();
    let persona = persona.trim();

    let mut steps = vec![
        "Introduction: Build rapport and establish credibility".to_string(),
        "Discovery: Understand pain points and current processes".to_string(),
    ];

    if !company.is_empty() {
        steps.push(format!(
            "Company Background: Acknowledge {}'s market position and challenges",
            company
        ));
    }

    steps.push("Solution Presentation: Align product benefits with specific needs".to_string());

    if !persona.is_empty() {
        steps.push(format!(
            "Personalized Value: Address specific concerns for {} role",
            persona
        ));
    }

    steps.push("Objection Handling: Address concerns proactively".to_string());
    steps.push("Closing: Clear next steps and timeline".to_string());
    steps
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_software_objections() {
        let objections = generate_objections("SaaS analytics platform", "Acme Corp", "");

        assert_eq!(objections.len(), 3);
        assert!(objections[0].response.contains("subscription model"));
        assert_eq!(objections[1].objection, "We already use Acme");
        assert!(objections[1].response.contains("integration capabilities"));
        assert_eq!(
            objections[2].objection,
            "We don't have IT resources to implement this"
        );
    }

    #[test]
    fn test_generic_objections() {
        let objections = generate_objections("Office furniture", "", "");

        assert_eq!(objections[0].response, "Response: Focus on ROI and long-term cost savings");
        assert_eq!(objections[1].objection, "We're happy with our current solution");
        assert_eq!(
            objections[2].objection,
            "We don't have time to implement something new"
        );
    }

    #[test]
    fn test_single_word_company() {
        let objections = generate_objections("widgets", "Globex", "");
        assert_eq!(objections[1].objection, "We already use a similar solution");
    }

    #[test]
    fn test_persona_objection() {
        let objections = generate_objections("widgets", "", "IT Manager");
        assert_eq!(objections.len(), 4);
        assert_eq!(
            objections[3].objection,
            "I need to consult with senior leadership first"
        );
        assert!(objections[3].response.contains("their team"));

        let objections = generate_objections("widgets", "", "Engineer");
        assert_eq!(objections[3].objection, "I need to consult with my team first");
        assert!(objections[3].response.contains("key stakeholders"));
    }

    #[test]
    fn test_value_props_capped_at_four() {
        let props =
            generate_value_props("Workflow automation for customer data analytics and security");
        assert_eq!(props.len(), 4);
        assert_eq!(props[0], "Increases efficiency by automating repetitive tasks");
        assert_eq!(
            props[3],
            "Provides actionable insights through advanced analytics"
        );
    }

    #[test]
    fn test_value_props_defaults() {
        let props = generate_value_props("widgets");
        assert_eq!(
            props,
            vec![
                "Increases efficiency by streamlining workflows",
                "Reduces costs through automation and resource optimization",
                "Improves overall performance with better resource allocation",
            ]
        );
    }

    #[test]
    fn test_sales_script_steps() {
        let steps = generate_sales_script("Acme", "CFO");
        assert_eq!(steps.len(), 7);
        assert_eq!(
            steps[2],
            "Company Background: Acknowledge Acme's market position and challenges"
        );
        assert_eq!(
            steps[4],
            "Personalized Value: Address specific concerns for CFO role"
        );
        assert_eq!(steps[6], "Closing: Clear next steps and timeline");

        assert_eq!(generate_sales_script("", "").len(), 5);
    }

    #[test]
    fn test_render_and_summary() {
        let playbook = Playbook::generate("CRM software", "Initech Inc", "Sales Manager");
        let text = playbook.to_string();

        assert!(text.starts_with("Playbook: CRM software"));
        assert!(text.contains("Objections:"));
        assert!(text.contains("Call outline:"));

        let summary = playbook.spoken_summary();
        assert!(summary.contains("It's too expensive"));
        assert!(!summary.contains("Response:"));
        assert!(summary.ends_with("closing: clear next steps and timeline."));
    }
}

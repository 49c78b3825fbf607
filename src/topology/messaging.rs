use crate::topology::{DeployableUnit, Handle, Result, Token};
use serde_json::{json, Value};
use tracing::debug;

pub type TopicRef = Handle<Topic>;

/// A messaging topic, e.g. the manual retry queue.
#[derive(Debug, Clone)]
pub struct Topic {
    id: String,
    topic_name: String,
}

impl Topic {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn topic_name(&self) -> &str {
        &self.topic_name
    }

    /// `Ref` of a topic resolves to its ARN.
    #[must_use]
    pub fn arn(&self) -> Token {
        Token::reference(&self.id)
    }

    pub(crate) fn render(&self) -> Value {
        json!({
            "Type": "AWS::SNS::Topic",
            "Properties": { "TopicName": self.topic_name },
        })
    }
}

impl DeployableUnit {
    /// # Errors
    /// Returns [`crate::topology::Error::DuplicateResource`] if `id` is taken.
    pub fn define_topic(&mut self, id: &str, topic_name: &str) -> Result<TopicRef> {
        self.claim(id)?;
        debug!(unit = %self.name(), topic = topic_name, "topic defined");
        self.topics.push(Topic {
            id: id.to_string(),
            topic_name: topic_name.to_string(),
        });
        Ok(Handle::new(self.id(), self.topics.len() - 1))
    }

    /// # Errors
    /// Returns [`crate::topology::Error::ForeignHandle`] if `topic` was not issued by this unit.
    pub fn topic(&self, topic: TopicRef) -> Result<&Topic> {
        let index = self.owned(topic, self.topics.len())?;
        Ok(&self.topics[index])
    }

    #[must_use]
    pub fn topics(&self) -> &[Topic] {
        &self.topics
    }
}

//! Mailbox-backed report source: a cursor over the unseen messages of one
//! IMAP mailbox.

use crate::error::{ItemError, MailboxError, MessageError, SourceError};
use crate::mailbox::message::MailMessage;
use crate::mailbox::{MailStore, MessageOverview};

use super::action::{ActionKind, SourceAction};
use super::{ReportFile, Source, SourceKind, SourceParams};

const DEFAULT_DONE: &str = "mark_seen";
const DEFAULT_FAILED: &str = "move_to:failed";

pub struct MailboxSource<M> {
    store: M,
    /// Snapshot of unseen message numbers, taken at rewind.
    list: Vec<u32>,
    index: usize,
    /// The message last yielded by `current`, kept for the disposition
    /// calls. Present even when extraction failed.
    message: Option<MailMessage>,
    when_done: Vec<SourceAction>,
    when_failed: Vec<SourceAction>,
}

impl<M: MailStore> MailboxSource<M> {
    pub fn new(store: M) -> Self {
        Self {
            store,
            list: Vec::new(),
            index: 0,
            message: None,
            when_done: SourceAction::from_settings(&[], false, DEFAULT_DONE),
            when_failed: SourceAction::from_settings(&[], false, DEFAULT_FAILED),
        }
    }

    pub fn store_mut(&mut self) -> &mut M {
        &mut self.store
    }

    fn current_number(&self) -> Option<u32> {
        self.message
            .as_ref()
            .map(MailMessage::number)
            .or_else(|| self.list.get(self.index).copied())
    }

    async fn extract(&mut self, message: &mut MailMessage) -> Result<ReportFile, ItemError> {
        message.validate(&mut self.store).await?;
        let attachment = message
            .attachment()
            .ok_or(MessageError::AttachmentCount(0))?;
        let filename = attachment.filename().to_string();
        let mime_type = attachment.mime_type().to_string();
        let data = attachment.content(&mut self.store).await?.to_vec();
        Ok(ReportFile {
            filename,
            mime_type,
            data,
        })
    }

    async fn apply_actions(&mut self, actions: Vec<SourceAction>) -> Result<(), SourceError> {
        let Some(number) = self.message.as_ref().map(MailMessage::number) else {
            return Ok(());
        };
        for action in actions {
            match action.kind {
                ActionKind::MarkSeen => self.store.set_seen(number).await?,
                ActionKind::Move => {
                    if let Some(target) = &action.param {
                        self.store.move_message(number, target).await?;
                    }
                }
                ActionKind::Delete => self.store.delete_message(number).await?,
            }
        }
        Ok(())
    }
}

impl<M: MailStore + Send> Source for MailboxSource<M> {
    fn kind(&self) -> SourceKind {
        SourceKind::Mailbox
    }

    fn label(&self) -> String {
        self.store.label()
    }

    fn configure(&mut self, params: &SourceParams) {
        self.when_done = SourceAction::from_settings(&params.when_done, false, DEFAULT_DONE);
        self.when_failed = SourceAction::from_settings(&params.when_failed, false, DEFAULT_FAILED);
    }

    async fn rewind(&mut self) -> Result<(), SourceError> {
        self.list = self.store.unseen_sorted().await.map_err(SourceError::from)?;
        self.index = 0;
        self.message = None;
        Ok(())
    }

    fn valid(&self) -> bool {
        self.index < self.list.len()
    }

    fn key(&self) -> usize {
        self.index
    }

    async fn current(&mut self) -> Result<ReportFile, ItemError> {
        let number = self.list.get(self.index).copied().ok_or_else(|| {
            ItemError::from(MailboxError::Protocol("cursor out of range".into()))
        })?;
        let mut message = MailMessage::new(number);
        let result = self.extract(&mut message).await;
        // Keep the message around either way so the dispositions can act
        // on a rejected item too.
        self.message = Some(message);
        result
    }

    fn next(&mut self) {
        self.index += 1;
        self.message = None;
    }

    async fn accepted(&mut self) -> Result<(), SourceError> {
        let actions = self.when_done.clone();
        self.apply_actions(actions).await
    }

    async fn rejected(&mut self) -> Result<(), SourceError> {
        let actions = self.when_failed.clone();
        self.apply_actions(actions).await
    }

    async fn overview(&mut self) -> Option<MessageOverview> {
        let number = self.current_number()?;
        self.store.overview(number).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::testing::{FakeMessage, FakeStore};

    // Long enough to clear the minimum attachment size.
    const XML: &[u8] =
        b"<feedback><report_metadata><org_name>acme</org_name></report_metadata></feedback>";

    fn two_message_store() -> FakeStore {
        let mut store = FakeStore::default();
        store
            .messages
            .insert(3, FakeMessage::with_attachment("good.xml", XML));
        // No attachment at all: gets rejected during validation.
        store.messages.insert(7, FakeMessage {
            unseen: true,
            ..FakeMessage::default()
        });
        store
    }

    #[tokio::test]
    async fn iterates_unseen_messages_in_order() {
        let mut source = MailboxSource::new(two_message_store());
        source.rewind().await.unwrap();

        assert!(source.valid());
        assert_eq!(source.key(), 0);
        let file = source.current().await.unwrap();
        assert_eq!(file.filename, "good.xml");
        assert_eq!(file.mime_type, "text/xml");
        assert_eq!(file.data, XML);

        source.next();
        assert!(source.valid());
        assert!(source.current().await.is_err());
        source.next();
        assert!(!source.valid());
    }

    #[tokio::test]
    async fn applies_default_dispositions() {
        let mut source = MailboxSource::new(two_message_store());
        source.rewind().await.unwrap();

        source.current().await.unwrap();
        source.accepted().await.unwrap();
        source.next();

        source.current().await.unwrap_err();
        source.rejected().await.unwrap();
        source.next();

        let store = source.store_mut();
        assert_eq!(store.seen, vec![3]);
        assert_eq!(store.moved, vec![(7, "failed".to_string())]);
        assert!(store.deleted.is_empty());
    }

    #[tokio::test]
    async fn configured_actions_replace_the_defaults() {
        let mut source = MailboxSource::new(two_message_store());
        source.configure(&SourceParams {
            when_done: vec!["move_to:done".to_string(), "mark_seen".to_string()],
            when_failed: vec!["delete".to_string()],
        });
        source.rewind().await.unwrap();

        source.current().await.unwrap();
        source.accepted().await.unwrap();
        source.next();

        source.current().await.unwrap_err();
        source.rejected().await.unwrap();

        let store = source.store_mut();
        assert_eq!(store.moved, vec![(3, "done".to_string())]);
        assert_eq!(store.seen, vec![3]);
        assert_eq!(store.deleted, vec![7]);
    }

    #[tokio::test]
    async fn rejected_without_current_is_a_no_op() {
        let mut source = MailboxSource::new(two_message_store());
        source.rewind().await.unwrap();
        source.rejected().await.unwrap();
        assert!(source.store_mut().moved.is_empty());
    }
}

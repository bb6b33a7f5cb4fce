use std::sync::Arc;

use once_cell::sync::OnceCell;
use serenity::all::{
    Command, CommandInteraction, ComponentInteraction, Context, CreateInteractionResponseFollowup,
    CreateInteractionResponse, CreateInteractionResponseMessage, EditInteractionResponse,
    EventHandler, Guild, GuildId, Interaction, Member, Message, Reaction, Ready, User,
};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, error, info, warn};

use super::commands::{self, CommandDispatcher, ComponentAction, ComponentReply, Invocation, Reply};
use super::embed;
use super::platform::SerenityPlatform;
use crate::config::Config;
use crate::db::DatabaseManager;
use crate::platform::{GuildPlatform, MemberSnapshot};
use crate::roles::{PickerOutcome, RoleCore};
use crate::utils::time::Clock;
use crate::web;

/// Services that need the gateway's HTTP client, built once on the first Ready.
pub(crate) struct Bound {
    pub(crate) core: Arc<RoleCore>,
    pub(crate) platform: Arc<SerenityPlatform>,
    pub(crate) dispatcher: CommandDispatcher,
}

pub(crate) struct RoleEventHandler {
    pub(crate) config: Arc<Config>,
    pub(crate) db: DatabaseManager,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) bound: Arc<OnceCell<Bound>>,
    pub(crate) ready_sender: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl RoleEventHandler {
    fn bind(&self, ctx: &Context, ready: &Ready) -> &Bound {
        self.bound.get_or_init(|| {
            let platform = Arc::new(SerenityPlatform::new(
                ctx.http.clone(),
                ctx.cache.clone(),
                ready.user.id,
            ));
            let core = Arc::new(RoleCore::new(
                &self.db,
                platform.clone(),
                self.clock.clone(),
                &self.config.requests,
            ));
            let dispatcher = CommandDispatcher::new(
                core.clone(),
                platform.clone(),
                platform.clone(),
                self.config.bot.dashboard_url.clone(),
            );
            Bound {
                core,
                platform,
                dispatcher,
            }
        })
    }

    async fn invoker(&self, bound: &Bound, member: Option<&Member>) -> Option<MemberSnapshot> {
        let member = member?;
        match bound.platform.snapshot_invoker(member, member.permissions).await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(user_id = member.user.id.get(), "failed to resolve invoking member: {e}");
                None
            }
        }
    }

    async fn on_command(&self, ctx: &Context, bound: &Bound, command: CommandInteraction) {
        let public = commands::answers_publicly(&command.data.name);
        let defer = CreateInteractionResponse::Defer(CreateInteractionResponseMessage::new().ephemeral(!public));
        if let Err(e) = command.create_response(&ctx.http, defer).await {
            warn!(command = %command.data.name, "failed to defer command: {e}");
            return;
        }

        let reply = match self.invoker(bound, command.member.as_deref()).await {
            Some(actor) => {
                let invocation = Invocation::from_options(&command.data.name, &command.data.options);
                bound.dispatcher.dispatch(&actor, &invocation).await
            }
            None if command.guild_id.is_none() => Reply::private(embed::info(
                "Server only",
                "Role commands only work inside a server.",
            )),
            None => Reply::private(embed::generic_failure()),
        };

        let answered = if reply.ephemeral == !public {
            command
                .edit_response(&ctx.http, EditInteractionResponse::new().embed(reply.embed.to_create_embed()))
                .await
                .map(|_| ())
        } else {
            // the deferral fixed the visibility; swap the placeholder for a follow-up
            if let Err(e) = command.delete_response(&ctx.http).await {
                debug!(command = %command.data.name, "failed to drop deferred reply: {e}");
            }
            command
                .create_followup(
                    &ctx.http,
                    CreateInteractionResponseFollowup::new()
                        .embed(reply.embed.to_create_embed())
                        .ephemeral(reply.ephemeral),
                )
                .await
                .map(|_| ())
        };
        if let Err(e) = answered {
            warn!(command = %command.data.name, "failed to answer command: {e}");
        }
    }

    async fn on_component(&self, ctx: &Context, bound: &Bound, component: ComponentInteraction) {
        let Some(action) = ComponentAction::parse(&component.data.custom_id) else {
            debug!(custom_id = %component.data.custom_id, "ignoring unknown component");
            return;
        };
        if let Err(e) = component
            .create_response(&ctx.http, CreateInteractionResponse::Acknowledge)
            .await
        {
            warn!(custom_id = %component.data.custom_id, "failed to acknowledge button press: {e}");
            return;
        }

        let reply = match self.invoker(bound, component.member.as_ref()).await {
            Some(actor) => bound.dispatcher.press(&actor, action).await,
            None => ComponentReply::Reply(Reply::private(embed::generic_failure())),
        };

        let answered = match reply {
            ComponentReply::UpdateMessage(card) => component
                .edit_response(
                    &ctx.http,
                    EditInteractionResponse::new()
                        .embed(card.to_create_embed())
                        .components(Vec::new()),
                )
                .await
                .map(|_| ()),
            ComponentReply::Reply(reply) => component
                .create_followup(
                    &ctx.http,
                    CreateInteractionResponseFollowup::new()
                        .embed(reply.embed.to_create_embed())
                        .ephemeral(reply.ephemeral),
                )
                .await
                .map(|_| ()),
        };
        if let Err(e) = answered {
            warn!(custom_id = %component.data.custom_id, "failed to answer button press: {e}");
        }
    }

    async fn on_reaction(&self, reaction: &Reaction, added: bool) {
        let Some(bound) = self.bound.get() else {
            return;
        };
        let (Some(guild_id), Some(user_id)) = (reaction.guild_id, reaction.user_id) else {
            return;
        };
        let member = match bound.platform.fetch_member(guild_id.get(), user_id.get()).await {
            Ok(Some(member)) => member,
            Ok(None) => return,
            Err(e) => {
                warn!(guild_id = guild_id.get(), user_id = user_id.get(), "failed to load reacting member: {e}");
                return;
            }
        };

        let emoji = reaction.emoji.to_string();
        let message_id = reaction.message_id.get();
        let outcome = if added {
            bound
                .core
                .pickers
                .reaction_added(&member, reaction.channel_id.get(), message_id, &emoji)
                .await
        } else {
            bound
                .core
                .pickers
                .reaction_removed(&member, message_id, &emoji)
                .await
        };
        match outcome {
            Ok(PickerOutcome::Ignored) => {}
            Ok(_) => debug!(guild_id = guild_id.get(), user_id = user_id.get(), message_id, "reaction role applied"),
            Err(e) => warn!(guild_id = guild_id.get(), user_id = user_id.get(), message_id, "reaction role failed: {e}"),
        }
    }
}

#[serenity::async_trait]
impl EventHandler for RoleEventHandler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!(
            "discord gateway ready as {} ({}) in {} guilds",
            ready.user.name,
            ready.user.id,
            ready.guilds.len()
        );
        let bound = self.bind(&ctx, &ready);

        if self.config.bot.register_commands {
            match Command::set_global_commands(&ctx.http, commands::definitions()).await {
                Ok(registered) => info!(count = registered.len(), "registered slash commands"),
                Err(e) => error!("failed to register slash commands: {e}"),
            }
        }

        bound.core.start_sweepers(&self.config.scheduler);
        web::set_gateway_ready(true);

        if let Some(sender) = self.ready_sender.lock().await.take() {
            let _ = sender.send(());
        }
    }

    async fn guild_create(&self, _ctx: Context, guild: Guild, is_new: Option<bool>) {
        let Some(bound) = self.bound.get() else {
            return;
        };
        match bound.core.settings.ensure_guild(guild.id.get(), &guild.name).await {
            Ok(_) if is_new == Some(true) => info!(guild_id = guild.id.get(), name = %guild.name, "joined new guild"),
            Ok(_) => {}
            Err(e) => warn!(guild_id = guild.id.get(), "failed to prepare guild config: {e}"),
        }
    }

    async fn guild_member_addition(&self, _ctx: Context, new_member: Member) {
        let Some(bound) = self.bound.get() else {
            return;
        };
        let guild_id = new_member.guild_id.get();
        let member = match bound.platform.snapshot_member(&new_member).await {
            Ok(member) => member,
            Err(e) => {
                warn!(guild_id, user_id = new_member.user.id.get(), "failed to snapshot joining member: {e}");
                return;
            }
        };
        match bound.core.auto_roles.handle_join(&member).await {
            Ok(report) => debug!(
                guild_id,
                user_id = member.user_id,
                assigned = report.assigned.len(),
                scheduled = report.scheduled.len(),
                "handled member join"
            ),
            Err(e) => warn!(guild_id, user_id = member.user_id, "auto-roles failed on join: {e}"),
        }
    }

    async fn guild_member_removal(
        &self,
        _ctx: Context,
        guild_id: GuildId,
        user: User,
        _member_data_if_available: Option<Member>,
    ) {
        let Some(bound) = self.bound.get() else {
            return;
        };
        let cancelled = bound.core.auto_roles.handle_leave(guild_id.get(), user.id.get());
        if cancelled > 0 {
            debug!(guild_id = guild_id.get(), user_id = user.id.get(), cancelled, "cancelled pending auto-roles");
        }
    }

    async fn message(&self, _ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }
        let (Some(bound), Some(guild_id)) = (self.bound.get(), msg.guild_id) else {
            return;
        };
        if let Err(e) = bound.core.record_message(guild_id.get(), msg.author.id.get()).await {
            debug!(guild_id = guild_id.get(), user_id = msg.author.id.get(), "failed to record message: {e}");
        }
    }

    async fn reaction_add(&self, _ctx: Context, add_reaction: Reaction) {
        self.on_reaction(&add_reaction, true).await;
    }

    async fn reaction_remove(&self, _ctx: Context, removed_reaction: Reaction) {
        self.on_reaction(&removed_reaction, false).await;
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        let Some(bound) = self.bound.get() else {
            return;
        };
        match interaction {
            Interaction::Command(command) => self.on_command(&ctx, bound, command).await,
            Interaction::Component(component) => self.on_component(&ctx, bound, component).await,
            _ => {}
        }
    }
}

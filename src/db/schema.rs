diesel::table! {
    guild_configs (guild_id) {
        guild_id -> Text,
        config -> Text,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    role_requests (id) {
        id -> Text,
        guild_id -> Text,
        user_id -> Text,
        username -> Text,
        role_id -> Text,
        role_name -> Text,
        reason -> Nullable<Text>,
        tier_level -> Integer,
        status -> Text,
        requirements_met -> Bool,
        requirements_details -> Text,
        resolved_by -> Nullable<Text>,
        resolved_by_username -> Nullable<Text>,
        resolved_at -> Nullable<Timestamptz>,
        resolution_reason -> Nullable<Text>,
        created_at -> Timestamptz,
        expires_at -> Timestamptz,
    }
}

diesel::table! {
    activity_logs (id) {
        id -> Text,
        guild_id -> Text,
        action -> Text,
        target_user_id -> Nullable<Text>,
        target_username -> Nullable<Text>,
        performed_by -> Nullable<Text>,
        performed_by_username -> Nullable<Text>,
        role_id -> Nullable<Text>,
        role_name -> Nullable<Text>,
        details -> Nullable<Text>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    temp_roles (id) {
        id -> Text,
        guild_id -> Text,
        user_id -> Text,
        role_id -> Text,
        role_name -> Text,
        given_by -> Text,
        given_by_username -> Nullable<Text>,
        expires_at -> Timestamptz,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    user_stats (guild_id, user_id) {
        guild_id -> Text,
        user_id -> Text,
        message_count -> BigInt,
        last_message_at -> Nullable<Timestamptz>,
        joined_at -> Nullable<Timestamptz>,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    guild_configs,
    role_requests,
    activity_logs,
    temp_roles,
    user_stats,
);

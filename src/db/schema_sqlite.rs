// SQLite schema definitions
// Mirrors schema.rs with timestamps stored as fixed-width RFC 3339 text

diesel::table! {
    guild_configs (guild_id) {
        guild_id -> Text,
        config -> Text,
        created_at -> Text,
        updated_at -> Text,
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
        resolved_at -> Nullable<Text>,
        resolution_reason -> Nullable<Text>,
        created_at -> Text,
        expires_at -> Text,
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
        created_at -> Text,
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
        expires_at -> Text,
        created_at -> Text,
    }
}

diesel::table! {
    user_stats (guild_id, user_id) {
        guild_id -> Text,
        user_id -> Text,
        message_count -> BigInt,
        last_message_at -> Nullable<Text>,
        joined_at -> Nullable<Text>,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    guild_configs,
    role_requests,
    activity_logs,
    temp_roles,
    user_stats,
);

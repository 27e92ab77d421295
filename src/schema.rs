diesel::table! {
    datasets (id) {
        id -> Text,
        name -> Text,
        label -> Nullable<Text>,
        description -> Nullable<Text>,
        currency -> Nullable<Text>,
        category -> Nullable<Text>,
        private -> Bool,
        languages -> Array<Text>,
        territories -> Array<Text>,
        data -> Jsonb,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    dataset_managers (dataset_id, account_id) {
        dataset_id -> Text,
        account_id -> Uuid,
    }
}

diesel::joinable!(dataset_managers -> datasets (dataset_id));

diesel::allow_tables_to_appear_in_same_query!(datasets, dataset_managers,);
